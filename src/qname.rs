//! Qualified metric name ("qname") parsing, canonicalization, equality,
//! pattern matching, and mutation.
//!
//! A qname is an ordered, sorted-by-key bag of `key[=value]` pairs with an
//! optional leading metric and an optional trailing wildcard marker. See
//! `SPEC_FULL.md` §3 / §4.1 for the full grammar and invariants.

use crate::error::Error;
use core::fmt;

/// Maximum number of key/value pairs a qname may hold.
pub const MAX_PAIRS: usize = 64;
/// Maximum length, in octets, of a qname's textual input.
pub const MAX_INPUT: usize = 4095;

const WILDCARD: &str = "*";

/// The value half of a qname pair, as returned by [`Qname::get`].
///
/// A [`QnameValue::Wildcard`] is the reserved sentinel (written `*` in
/// textual form) and is never equal to a literal value, even one whose text
/// happens to also be `"*"` (reachable only via an escaped `\*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QnameValue<'a> {
    Wildcard,
    Literal(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueView<'a> {
    Absent,
    Wildcard,
    Present(&'a str),
}

#[derive(Debug, Clone, Copy)]
enum CValue {
    Absent,
    Wildcard,
    Present(usize, usize),
}

#[derive(Debug, Clone, Copy)]
struct CPair {
    key: (usize, usize),
    value: CValue,
}

#[derive(Debug, Clone)]
struct Contracted {
    flyweight: String,
    metric: Option<(usize, usize)>,
    pairs: Vec<CPair>,
}

#[derive(Debug, Clone)]
enum EValue {
    Absent,
    Wildcard,
    Present(String),
}

#[derive(Debug, Clone)]
struct Expanded {
    metric: Option<String>,
    pairs: Vec<(String, EValue)>,
}

#[derive(Debug, Clone)]
enum Storage {
    Contracted(Contracted),
    Expanded(Expanded),
}

/// A parsed, sorted, optionally-wildcarded qualified metric name.
///
/// Freshly parsed qnames are stored in a single contiguous "flyweight"
/// buffer (cheap to parse, cheap to duplicate); the first mutation
/// (`set`/`unset`/`merge`) expands each key and value into its own owned
/// `String`. See `DESIGN.md` for why offsets, not pointers, are used to
/// reference the flyweight.
#[derive(Debug, Clone)]
pub struct Qname {
    storage: Storage,
    wild: bool,
}

fn is_plain(c: char) -> bool {
    !matches!(c, ',' | '=' | '*' | '\\') && !c.is_control()
}

fn trim_span(flyweight: &str, span: (usize, usize)) -> (usize, usize) {
    let (s, e) = span;
    let slice = &flyweight[s..e];
    let left = slice.len() - slice.trim_start_matches(' ').len();
    let trimmed_len = slice.trim_matches(' ').len();
    (s + left, s + left + trimmed_len)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    K1,
    K2,
    V1,
    V2,
    M,
}

impl Qname {
    /// Parses a qname from its textual form.
    ///
    /// Returns [`Error::QnameTooLong`] if `s` exceeds [`MAX_INPUT`] octets,
    /// [`Error::QnameTooManyPairs`] if more than [`MAX_PAIRS`] pairs would
    /// result, and [`Error::QnameMalformed`] for any other grammar
    /// violation.
    pub fn parse(s: &str) -> Result<Qname, Error> {
        if s.len() > MAX_INPUT {
            log::debug!(
                "qname input is {} octets long (> {})",
                s.len(),
                MAX_INPUT
            );
            return Err(Error::QnameTooLong);
        }

        let trimmed = s.trim_start_matches(' ');
        let (metric_text, pair_input): (Option<&str>, &str) = {
            let mut boundary: Option<(usize, char)> = None;
            for (idx, c) in trimmed.char_indices() {
                if c == ' ' || c == ',' || c == '=' || c == '\\' {
                    boundary = Some((idx, c));
                    break;
                }
            }
            match boundary {
                Some((idx, ' ')) => {
                    let metric = &trimmed[..idx];
                    let rest = trimmed[idx..].trim_start_matches(' ');
                    (Some(metric), rest)
                }
                Some(_) => (None, trimmed),
                None => {
                    if trimmed.is_empty() {
                        (None, trimmed)
                    } else {
                        (Some(trimmed), "")
                    }
                }
            }
        };

        let mut flyweight = String::with_capacity(s.len());
        let metric_span = metric_text.map(|m| {
            let start = flyweight.len();
            flyweight.push_str(m);
            (start, flyweight.len())
        });

        let mut state = State::K1;
        let mut escaped = false;
        let mut wild = false;
        let mut cur_start: Option<usize> = None;
        let mut pending_key: Option<(usize, usize)> = None;
        let mut pending_value = CValue::Absent;
        let mut pairs: Vec<CPair> = Vec::new();

        macro_rules! close_pair {
            () => {{
                if let Some(key) = pending_key.take() {
                    if pairs.len() >= MAX_PAIRS {
                        log::debug!("exceeded MAX_PAIRS ({}) while parsing qname", MAX_PAIRS);
                        return Err(Error::QnameTooManyPairs);
                    }
                    pairs.push(CPair {
                        key,
                        value: pending_value,
                    });
                }
                pending_value = CValue::Absent;
            }};
        }

        for c in pair_input.chars() {
            if escaped {
                match state {
                    State::K1 => {
                        cur_start = Some(flyweight.len());
                        flyweight.push(c);
                        state = State::K2;
                    }
                    State::K2 => flyweight.push(c),
                    State::V1 => {
                        cur_start = Some(flyweight.len());
                        flyweight.push(c);
                        state = State::V2;
                    }
                    State::V2 => flyweight.push(c),
                    State::M => {
                        log::debug!("escape sequence is invalid in post-wildcard state");
                        return Err(Error::QnameMalformed);
                    }
                }
                escaped = false;
                continue;
            }

            match state {
                State::K1 => {
                    if c == '\\' {
                        escaped = true;
                    } else if c == ' ' {
                        // skip leading whitespace before a key
                    } else if c == '*' {
                        wild = true;
                        state = State::M;
                    } else if is_plain(c) {
                        cur_start = Some(flyweight.len());
                        flyweight.push(c);
                        state = State::K2;
                    } else {
                        log::debug!("invalid token '{}' for transition from state K1", c);
                        return Err(Error::QnameMalformed);
                    }
                }
                State::K2 => {
                    if c == '\\' {
                        escaped = true;
                    } else if c == '=' {
                        let start = cur_start.take().unwrap();
                        pending_key = Some((start, flyweight.len()));
                        state = State::V1;
                    } else if c == ',' {
                        let start = cur_start.take().unwrap();
                        pending_key = Some((start, flyweight.len()));
                        pending_value = CValue::Absent;
                        close_pair!();
                        state = State::K1;
                    } else if is_plain(c) {
                        flyweight.push(c);
                    } else {
                        log::debug!("invalid token '{}' for transition from state K2", c);
                        return Err(Error::QnameMalformed);
                    }
                }
                State::V1 => {
                    if c == '\\' {
                        escaped = true;
                    } else if c == '*' {
                        pending_value = CValue::Wildcard;
                        state = State::M;
                    } else if c == ',' {
                        let here = flyweight.len();
                        pending_value = CValue::Present(here, here);
                        close_pair!();
                        state = State::K1;
                    } else if is_plain(c) {
                        cur_start = Some(flyweight.len());
                        flyweight.push(c);
                        state = State::V2;
                    } else {
                        log::debug!("invalid token '{}' for transition from state V1", c);
                        return Err(Error::QnameMalformed);
                    }
                }
                State::V2 => {
                    if c == '\\' {
                        escaped = true;
                    } else if c == ',' {
                        let start = cur_start.take().unwrap();
                        pending_value = CValue::Present(start, flyweight.len());
                        close_pair!();
                        state = State::K1;
                    } else if is_plain(c) {
                        flyweight.push(c);
                    } else {
                        log::debug!("invalid token '{}' for transition from state V2", c);
                        return Err(Error::QnameMalformed);
                    }
                }
                State::M => {
                    if c == ',' {
                        close_pair!();
                        state = State::K1;
                    } else {
                        log::debug!("invalid token '{}' for transition from state M", c);
                        return Err(Error::QnameMalformed);
                    }
                }
            }
        }

        if escaped {
            log::debug!("qname input ends with a dangling escape");
            return Err(Error::QnameMalformed);
        }

        if !pair_input.is_empty() {
            match state {
                State::K2 => {
                    let start = cur_start.take().unwrap();
                    pending_key = Some((start, flyweight.len()));
                    pending_value = CValue::Absent;
                    close_pair!();
                }
                State::V1 => {
                    let here = flyweight.len();
                    pending_value = CValue::Present(here, here);
                    close_pair!();
                }
                State::V2 => {
                    let start = cur_start.take().unwrap();
                    pending_value = CValue::Present(start, flyweight.len());
                    close_pair!();
                }
                State::M => {
                    close_pair!();
                }
                State::K1 => {
                    log::debug!("qname input ends mid-pair with no key");
                    return Err(Error::QnameMalformed);
                }
            }
        }

        for pair in &mut pairs {
            let (ks, ke) = trim_span(&flyweight, pair.key);
            if ks == ke {
                log::debug!("qname key was pure whitespace after trimming");
                return Err(Error::QnameMalformed);
            }
            pair.key = (ks, ke);
            if let CValue::Present(vs, ve) = pair.value {
                pair.value = CValue::Present(vs, ve).trim(&flyweight);
            }
        }

        pairs.sort_by(|a, b| flyweight[a.key.0..a.key.1].cmp(&flyweight[b.key.0..b.key.1]));

        Ok(Qname {
            wild,
            storage: Storage::Contracted(Contracted {
                flyweight,
                metric: metric_span,
                pairs,
            }),
        })
    }

    /// Mirrors the original C API's handling of a null input pointer.
    pub fn parse_opt(s: Option<&str>) -> Result<Qname, Error> {
        match s {
            Some(s) => Qname::parse(s),
            None => Err(Error::QnameMalformed),
        }
    }

    fn metric_text(&self) -> Option<&str> {
        match &self.storage {
            Storage::Contracted(c) => c.metric.map(|(s, e)| &c.flyweight[s..e]),
            Storage::Expanded(e) => e.metric.as_deref(),
        }
    }

    fn pair_count(&self) -> usize {
        match &self.storage {
            Storage::Contracted(c) => c.pairs.len(),
            Storage::Expanded(e) => e.pairs.len(),
        }
    }

    fn pair_view(&self, i: usize) -> (&str, ValueView<'_>) {
        match &self.storage {
            Storage::Contracted(c) => {
                let p = &c.pairs[i];
                let key = &c.flyweight[p.key.0..p.key.1];
                let value = match p.value {
                    CValue::Absent => ValueView::Absent,
                    CValue::Wildcard => ValueView::Wildcard,
                    CValue::Present(s, e) => ValueView::Present(&c.flyweight[s..e]),
                };
                (key, value)
            }
            Storage::Expanded(e) => {
                let (k, v) = &e.pairs[i];
                let value = match v {
                    EValue::Absent => ValueView::Absent,
                    EValue::Wildcard => ValueView::Wildcard,
                    EValue::Present(s) => ValueView::Present(s.as_str()),
                };
                (k.as_str(), value)
            }
        }
    }

    fn find_pair(&self, key: &str) -> Option<ValueView<'_>> {
        (0..self.pair_count())
            .map(|i| self.pair_view(i))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    fn expand(&mut self) {
        if matches!(self.storage, Storage::Expanded(_)) {
            return;
        }
        let metric = self.metric_text().map(|s| s.to_string());
        let pairs = (0..self.pair_count())
            .map(|i| {
                let (k, v) = self.pair_view(i);
                let ev = match v {
                    ValueView::Absent => EValue::Absent,
                    ValueView::Wildcard => EValue::Wildcard,
                    ValueView::Present(s) => EValue::Present(s.to_string()),
                };
                (k.to_string(), ev)
            })
            .collect();
        self.storage = Storage::Expanded(Expanded { metric, pairs });
    }

    /// Returns this qname's canonical textual rendering.
    ///
    /// Re-parsing the result always yields an equal qname
    /// (canonicalization is idempotent).
    pub fn to_canonical(&self) -> String {
        let mut out = String::new();
        if let Some(metric) = self.metric_text() {
            out.push_str(metric);
            out.push(' ');
        }
        let mut first = true;
        for i in 0..self.pair_count() {
            let (k, v) = self.pair_view(i);
            if !first {
                out.push(',');
            }
            first = false;
            out.push_str(k);
            match v {
                ValueView::Present(s) => {
                    out.push('=');
                    out.push_str(s);
                }
                ValueView::Wildcard => out.push_str("=*"),
                ValueView::Absent => {}
            }
        }
        if self.wild {
            if !first {
                out.push(',');
            }
            out.push('*');
        }
        out
    }

    /// Returns the value stored for `key`, or `None` if `key` is absent or
    /// present without a value.
    pub fn get(&self, key: &str) -> Option<QnameValue<'_>> {
        match self.find_pair(key)? {
            ValueView::Absent => None,
            ValueView::Wildcard => Some(QnameValue::Wildcard),
            ValueView::Present(s) => Some(QnameValue::Literal(s)),
        }
    }

    /// Sets (or replaces) the value for `key`. `value == Some("*")` stores
    /// the wildcard sentinel rather than the literal text `"*"`.
    ///
    /// Fails with [`Error::QnameCapacityExceeded`] if the qname is already
    /// at [`MAX_PAIRS`] and `key` is not already present.
    pub fn set(&mut self, key: &str, value: Option<&str>) -> Result<(), Error> {
        self.expand();
        let Storage::Expanded(e) = &mut self.storage else {
            unreachable!("expand() always produces Expanded storage")
        };
        let new_value = match value {
            None => EValue::Absent,
            Some(v) if v == WILDCARD => EValue::Wildcard,
            Some(v) => EValue::Present(v.to_string()),
        };
        match e.pairs.binary_search_by(|(k, _)| k.as_str().cmp(key)) {
            Ok(idx) => {
                e.pairs[idx].1 = new_value;
            }
            Err(idx) => {
                if e.pairs.len() >= MAX_PAIRS {
                    log::warn!("qname is full; cannot set new key '{}'", key);
                    return Err(Error::QnameCapacityExceeded);
                }
                e.pairs.insert(idx, (key.to_string(), new_value));
            }
        }
        Ok(())
    }

    /// Removes the pair for `key`, if present, compacting the remaining
    /// pairs so sorted order is preserved. A no-op if `key` is absent.
    pub fn unset(&mut self, key: &str) {
        self.expand();
        let Storage::Expanded(e) = &mut self.storage else {
            unreachable!("expand() always produces Expanded storage")
        };
        if let Ok(idx) = e.pairs.binary_search_by(|(k, _)| k.as_str().cmp(key)) {
            e.pairs.remove(idx);
        }
    }

    /// Applies `set(key, value)` to `self` for every pair in `other`. Keys
    /// unique to `self` are retained; keys present in both are overwritten
    /// with `other`'s value.
    pub fn merge(&mut self, other: &Qname) -> Result<(), Error> {
        self.expand();
        for i in 0..other.pair_count() {
            let (k, v) = other.pair_view(i);
            let value = match v {
                ValueView::Absent => None,
                ValueView::Wildcard => Some(WILDCARD),
                ValueView::Present(s) => Some(s),
            };
            self.set(k, value)?;
        }
        Ok(())
    }

    /// Produces an independent copy; mutating the copy never affects
    /// `self`.
    pub fn dup(&self) -> Qname {
        self.clone()
    }

    /// Returns `true` iff `self` and `other` are exactly equivalent:
    /// same wildcard flag, same pair count, same metric, and
    /// byte-identical keys/values at every (sorted) position. A wildcard
    /// value only equals another wildcard value at the same key.
    pub fn equal(&self, other: &Qname) -> bool {
        if self.wild != other.wild {
            return false;
        }
        if self.pair_count() != other.pair_count() {
            return false;
        }
        if self.metric_text() != other.metric_text() {
            return false;
        }
        for i in 0..self.pair_count() {
            let (k1, v1) = self.pair_view(i);
            let (k2, v2) = other.pair_view(i);
            if k1 != k2 {
                return false;
            }
            if !value_eq(v1, v2) {
                return false;
            }
        }
        true
    }

    /// Returns `true` iff `self` satisfies every constraint in `pattern`,
    /// honoring wildcard semantics in the pattern (see `SPEC_FULL.md`
    /// §4.1.4).
    pub fn matches(&self, pattern: &Qname) -> bool {
        if let Some(pm) = pattern.metric_text() {
            if pm != WILDCARD && self.metric_text() != Some(pm) {
                return false;
            }
        }
        for i in 0..pattern.pair_count() {
            let (k, pv) = pattern.pair_view(i);
            match self.find_pair(k) {
                None => return false,
                Some(sv) => {
                    if matches!(pv, ValueView::Wildcard) {
                        continue;
                    }
                    if !value_eq(sv, pv) {
                        return false;
                    }
                }
            }
        }
        if self.pair_count() != pattern.pair_count() && !pattern.wild {
            return false;
        }
        true
    }
}

fn value_eq(a: ValueView<'_>, b: ValueView<'_>) -> bool {
    match (a, b) {
        (ValueView::Absent, ValueView::Absent) => true,
        (ValueView::Wildcard, ValueView::Wildcard) => true,
        (ValueView::Present(x), ValueView::Present(y)) => x == y,
        _ => false,
    }
}

impl CValue {
    fn trim(self, flyweight: &str) -> CValue {
        match self {
            CValue::Present(s, e) => {
                let (ts, te) = trim_span(flyweight, (s, e));
                CValue::Present(ts, te)
            }
            other => other,
        }
    }
}

impl fmt::Display for Qname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

impl PartialEq for Qname {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl Eq for Qname {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_boundary_lengths() {
        assert!(matches!(Qname::parse_opt(None), Err(Error::QnameMalformed)));

        let mut s = "k=".to_string();
        s.push_str(&"v".repeat(8191 - 2));
        assert_eq!(s.len(), 8191);
        assert!(matches!(Qname::parse(&s), Err(Error::QnameTooLong)));

        let s4096 = &s[..4096];
        assert!(matches!(Qname::parse(s4096), Err(Error::QnameTooLong)));

        let s4095 = &s[..4095];
        assert!(Qname::parse(s4095).is_ok());
    }

    #[test]
    fn scenario_basic_pairs_sort_and_render() {
        let qn = Qname::parse("cpu host=a,core=1").unwrap();
        assert_eq!(qn.to_canonical(), "cpu core=1,host=a");
    }

    #[test]
    fn scenario_wildcard_pattern_match() {
        let pattern = Qname::parse("cpu host=*,*").unwrap();
        assert!(pattern.wild);
        assert_eq!(pattern.to_canonical(), "cpu host=*,*");

        let a = Qname::parse("cpu host=x,env=prod").unwrap();
        assert!(a.matches(&pattern));

        let b = Qname::parse("mem host=x").unwrap();
        assert!(!b.matches(&pattern));
    }

    #[test]
    fn scenario_key_sort_equality() {
        let a = Qname::parse("b=2,a=1").unwrap();
        let b = Qname::parse("a=1,b=2").unwrap();
        assert!(a.equal(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn scenario_set_wildcard() {
        let mut qn = Qname::parse("a=1").unwrap();
        qn.set("a", Some("*")).unwrap();
        assert_eq!(qn.to_canonical(), "a=*");

        let anything = Qname::parse("a=anything").unwrap();
        assert!(anything.matches(&qn));
    }

    #[test]
    fn dup_is_independent() {
        let original = Qname::parse("svc host=a,env=prod").unwrap();
        let mut copy = original.dup();
        copy.set("env", Some("staging")).unwrap();
        copy.set("new", Some("field")).unwrap();

        assert_eq!(original.get("env"), Some(QnameValue::Literal("prod")));
        assert_eq!(copy.get("env"), Some(QnameValue::Literal("staging")));
        assert_eq!(original.get("new"), None);
        assert_eq!(copy.get("new"), Some(QnameValue::Literal("field")));
    }

    #[test]
    fn dup_of_expanded_qname_preserves_wildcard_sentinel() {
        let mut qn = Qname::parse("a=*,b=1").unwrap();
        qn.set("c", Some("2")).unwrap(); // forces expansion
        let copy = qn.dup();
        assert_eq!(copy.get("a"), Some(QnameValue::Wildcard));
        assert!(copy.equal(&qn));
    }

    #[test]
    fn get_distinguishes_absent_key_only_and_wildcard() {
        let qn = Qname::parse("a,b=*,c=1").unwrap();
        assert_eq!(qn.get("a"), None); // key-only pair: no value
        assert_eq!(qn.get("b"), Some(QnameValue::Wildcard));
        assert_eq!(qn.get("c"), Some(QnameValue::Literal("1")));
        assert_eq!(qn.get("nope"), None);
    }

    #[test]
    fn merge_overwrites_shared_keys_and_keeps_unique_ones() {
        let mut a = Qname::parse("a=1,b=2").unwrap();
        let b = Qname::parse("b=3,c=4").unwrap();
        a.merge(&b).unwrap();
        assert_eq!(a.to_canonical(), "a=1,b=3,c=4");
    }

    #[test]
    fn unset_compacts_and_preserves_order() {
        let mut qn = Qname::parse("a=1,b=2,c=3").unwrap();
        qn.unset("b");
        assert_eq!(qn.to_canonical(), "a=1,c=3");
        qn.unset("does-not-exist");
        assert_eq!(qn.to_canonical(), "a=1,c=3");
    }

    #[test]
    fn equal_rejects_wildcard_vs_literal_mismatch() {
        let a = Qname::parse("a=*").unwrap();
        let b = Qname::parse("a=x").unwrap();
        assert!(!a.equal(&b));
    }

    #[test]
    fn whitespace_is_trimmed_from_keys_and_values() {
        let qn = Qname::parse("metric  a = 1 , b=2").unwrap();
        assert_eq!(qn.get("a"), Some(QnameValue::Literal("1")));
        assert_eq!(qn.to_canonical(), "metric a=1,b=2");
    }

    #[test]
    fn empty_key_after_trim_is_rejected() {
        assert!(matches!(Qname::parse("   =1"), Err(Error::QnameMalformed)));
    }

    #[test]
    fn escaped_special_characters_are_stored_literally() {
        let qn = Qname::parse(r"a\,b=c\=d").unwrap();
        assert_eq!(qn.get("a,b"), Some(QnameValue::Literal("c=d")));
    }

    #[test]
    fn escaped_asterisk_is_a_literal_not_a_wildcard() {
        let qn = Qname::parse(r"a=\*").unwrap();
        assert_eq!(qn.get("a"), Some(QnameValue::Literal("*")));
        let literal_star = Qname::parse("a=*").unwrap(); // this one IS the wildcard
        assert!(!qn.equal(&literal_star));
    }

    #[test]
    fn no_metric_when_pairs_start_immediately() {
        let qn = Qname::parse("host=a,env=prod").unwrap();
        assert_eq!(qn.to_canonical(), "env=prod,host=a");
    }

    #[test]
    fn metric_only_wildcard_matches_any_metric() {
        let pattern = Qname::parse("*").unwrap();
        let any = Qname::parse("anything key=val").unwrap();
        assert!(any.matches(&pattern));
    }

    #[test]
    fn too_many_pairs_is_rejected() {
        let mut s = String::new();
        for i in 0..=MAX_PAIRS {
            if i > 0 {
                s.push(',');
            }
            s.push_str(&format!("k{}=v", i));
        }
        assert!(matches!(
            Qname::parse(&s),
            Err(Error::QnameTooManyPairs)
        ));
    }
}
