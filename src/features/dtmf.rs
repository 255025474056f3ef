//! The DTMF feature matcher: a two-state collector with a deadline.
//!
//! Digits accumulate while any hook code still has the collected
//! string as a prefix. An exact match dispatches; a dead end or an
//! expired interdigit deadline flushes the digits back toward the
//! bridge (when passthrough allows).

use crate::constants::MAX_DTMF_CODE_LEN;
use std::time::{Duration, Instant};

/// Result of probing the hook set with a digit string.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DtmfSearch {
    /// A hook code equals the string exactly.
    Exact,
    /// At least one hook code starts with the string.
    Partial,
    /// No hook code relates to the string.
    Miss,
}

/// What the join loop should do with a digit event.
#[derive(Debug, Eq, PartialEq)]
pub enum DigitVerdict {
    /// Not a feature digit; forward per passthrough policy.
    Pass,
    /// Swallow the frame; a sequence is (or may be) accumulating.
    Consume,
    /// Dispatch the hook registered under this code.
    Dispatch(String),
    /// No hook matched; stream these digits if passthrough allows.
    Flush(String),
}

/// Per-channel DTMF collection state.
#[derive(Debug, Default)]
pub struct DtmfCollector {
    collected: String,
    deadline: Option<Instant>,
}

impl DtmfCollector {
    /// Whether a sequence is currently accumulating.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        !self.collected.is_empty()
    }

    /// The armed interdigit deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Handles a DTMF begin event.
    ///
    /// A begin is consumed while collecting, and also when the digit
    /// could open a new sequence; otherwise it passes through.
    pub fn digit_begin<F>(&mut self, digit: char, lookup: F) -> DigitVerdict
    where
        F: Fn(&str) -> DtmfSearch,
    {
        if self.in_progress() {
            return DigitVerdict::Consume;
        }

        match lookup(&digit.to_string()) {
            DtmfSearch::Miss => DigitVerdict::Pass,
            _ => DigitVerdict::Consume,
        }
    }

    /// Handles a DTMF end event, appending the digit and resolving
    /// the collected string against the hook set.
    pub fn digit_end<F>(
        &mut self,
        digit: char,
        lookup: F,
        interdigit: Duration,
        now: Instant,
    ) -> DigitVerdict
    where
        F: Fn(&str) -> DtmfSearch,
    {
        if !self.in_progress() && lookup(&digit.to_string()) == DtmfSearch::Miss {
            return DigitVerdict::Pass;
        }

        self.collected.push(digit);
        if self.collected.len() > MAX_DTMF_CODE_LEN {
            return self.flush();
        }

        match lookup(&self.collected) {
            DtmfSearch::Exact => self.dispatch(),
            DtmfSearch::Partial => {
                self.deadline = Some(now + interdigit);
                DigitVerdict::Consume
            },
            DtmfSearch::Miss => self.flush(),
        }
    }

    /// Forces resolution with "no more digits", as the interdigit
    /// timeout does.
    pub fn timeout<F>(&mut self, lookup: F) -> DigitVerdict
    where
        F: Fn(&str) -> DtmfSearch,
    {
        if !self.in_progress() {
            self.deadline = None;
            return DigitVerdict::Consume;
        }

        match lookup(&self.collected) {
            DtmfSearch::Exact => self.dispatch(),
            _ => self.flush(),
        }
    }

    fn dispatch(&mut self) -> DigitVerdict {
        // Cleared before the callback runs: hooks may open a new
        // sequence of their own.
        self.deadline = None;
        DigitVerdict::Dispatch(std::mem::take(&mut self.collected))
    }

    fn flush(&mut self) -> DigitVerdict {
        self.deadline = None;
        DigitVerdict::Flush(std::mem::take(&mut self.collected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hookset(codes: &'static [&'static str]) -> impl Fn(&str) -> DtmfSearch {
        move |seq: &str| {
            if codes.iter().any(|c| c.eq_ignore_ascii_case(seq)) {
                DtmfSearch::Exact
            } else if codes
                .iter()
                .any(|c| c.to_ascii_lowercase().starts_with(&seq.to_ascii_lowercase()))
            {
                DtmfSearch::Partial
            } else {
                DtmfSearch::Miss
            }
        }
    }

    #[test]
    fn exact_match_dispatches_and_clears() {
        let lookup = hookset(&["*2"]);
        let mut c = DtmfCollector::default();
        let now = Instant::now();
        let gap = Duration::from_secs(3);

        assert_eq!(c.digit_end('*', &lookup, gap, now), DigitVerdict::Consume);
        assert_eq!(
            c.digit_end('2', &lookup, gap, now),
            DigitVerdict::Dispatch("*2".into())
        );
        assert!(!c.in_progress());
        assert!(c.deadline().is_none());
    }

    #[test]
    fn dead_end_flushes_collected() {
        let lookup = hookset(&["*2"]);
        let mut c = DtmfCollector::default();
        let now = Instant::now();
        let gap = Duration::from_secs(3);

        c.digit_end('*', &lookup, gap, now);
        assert_eq!(
            c.digit_end('9', &lookup, gap, now),
            DigitVerdict::Flush("*9".into())
        );
    }

    #[test]
    fn timeout_flushes_partial_sequence() {
        let lookup = hookset(&["*21"]);
        let mut c = DtmfCollector::default();
        let now = Instant::now();
        let gap = Duration::from_secs(3);

        c.digit_end('*', &lookup, gap, now);
        c.digit_end('2', &lookup, gap, now);
        assert!(c.deadline().is_some());

        assert_eq!(c.timeout(&lookup), DigitVerdict::Flush("*2".into()));
    }

    #[test]
    fn timeout_dispatches_exact_prefix() {
        // "*2" is both a full code and a prefix of "*21": timing out
        // after "*2" must dispatch rather than flush.
        let lookup = hookset(&["*2", "*21"]);
        let mut c = DtmfCollector::default();
        let now = Instant::now();
        let gap = Duration::from_secs(3);

        c.digit_end('*', &lookup, gap, now);
        assert_eq!(c.digit_end('2', &lookup, gap, now), DigitVerdict::Consume);
        assert_eq!(c.timeout(&lookup), DigitVerdict::Dispatch("*2".into()));
    }

    #[test]
    fn unrelated_digit_passes() {
        let lookup = hookset(&["*2"]);
        let mut c = DtmfCollector::default();

        assert_eq!(c.digit_begin('7', &lookup), DigitVerdict::Pass);
        assert_eq!(
            c.digit_end('7', &lookup, Duration::from_secs(3), Instant::now()),
            DigitVerdict::Pass
        );
    }

    #[test]
    fn begin_is_consumed_mid_sequence() {
        let lookup = hookset(&["*2"]);
        let mut c = DtmfCollector::default();
        let now = Instant::now();

        c.digit_end('*', &lookup, Duration::from_secs(3), now);
        assert_eq!(c.digit_begin('9', &lookup), DigitVerdict::Consume);
    }

    #[test]
    fn overlong_sequence_flushes() {
        let lookup = hookset(&["111111111111111111"]);
        let mut c = DtmfCollector::default();
        let now = Instant::now();
        let gap = Duration::from_secs(3);

        for _ in 0..MAX_DTMF_CODE_LEN {
            assert_eq!(c.digit_end('1', &lookup, gap, now), DigitVerdict::Consume);
        }
        assert!(matches!(
            c.digit_end('1', &lookup, gap, now),
            DigitVerdict::Flush(_)
        ));
    }
}
