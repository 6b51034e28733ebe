//! Character-level diff, context patches and the delta codec.
//!
//! ```text
//!  shadow ──┐
//!           ├── diff() ──► [Diff] ──┬── delta_encode() ──► "=5\t-2\t+ab"
//!  live ────┘                       │
//!                                   └── patch_make() ──► [Patch]
//!                                                          │
//!  live text + cursor offsets ─────────────────────────────┤
//!                                                          ▼
//!                                   patch_apply() ──► text, applied flags, offsets
//! ```
//!
//! All positions and lengths count Unicode scalar values (`char`), never bytes,
//! so deltas stay valid whatever the encoding of the host buffer.
//!
//! Patch location follows the classic diff-match-patch recipe: exact match at
//! the expected spot, then the nearest exact match, then a bitap fuzzy search.
//!
//! Reference: Myers, "An O(ND) Difference Algorithm and Its Variations" (1986)
//! Reference: Wu & Manber, "Fast Text Searching Allowing Errors" (1992)

use std::collections::HashMap;
use std::time::Duration;

use similar::{ChangeTag, TextDiff};
use thiserror::Error;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Kind of a diff run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp {
    Equal,
    Insert,
    Delete,
}

/// One run of a diff: `text` is kept, inserted or deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub op: DiffOp,
    pub text: String,
}

impl Diff {
    pub fn new(op: DiffOp, text: impl Into<String>) -> Self {
        Self { op, text: text.into() }
    }

    pub fn equal(text: impl Into<String>) -> Self {
        Self::new(DiffOp::Equal, text)
    }

    pub fn insert(text: impl Into<String>) -> Self {
        Self::new(DiffOp::Insert, text)
    }

    pub fn delete(text: impl Into<String>) -> Self {
        Self::new(DiffOp::Delete, text)
    }

    /// Length in characters.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// A context hunk produced by [`TextDiffPatch::patch_make`].
///
/// `start1`/`length1` address the source text, `start2`/`length2` the
/// target text, both in characters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    pub diffs: Vec<Diff>,
    pub start1: usize,
    pub start2: usize,
    pub length1: usize,
    pub length2: usize,
}

/// Result of [`TextDiffPatch::patch_apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Patched text.
    pub text: String,
    /// One flag per hunk: `false` if the hunk could not be located.
    pub applied: Vec<bool>,
    /// Input offsets remapped into `text`.
    pub offsets: Vec<usize>,
}

/// Delta decoding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid delta operation in token {0:?}")]
    InvalidOperation(String),
    #[error("invalid length in delta token {0:?}")]
    InvalidLength(String),
    #[error("invalid escape sequence in {0:?}")]
    InvalidEscape(String),
    #[error("delta covers {consumed} characters but the source text has {expected}")]
    LengthMismatch { consumed: usize, expected: usize },
}

// ───────────────────────────────────────────────────────────────────
// Capability
// ───────────────────────────────────────────────────────────────────

/// Diff/patch capability consumed by the synchronization engine.
///
/// The engine only ever talks to this trait; [`DiffMatchPatch`] is the
/// implementation shipped with the crate.
pub trait TextDiffPatch: Send + Sync {
    /// Compute the edit script turning `a` into `b`.
    fn diff(&self, a: &str, b: &str) -> Vec<Diff>;

    /// Normalize a diff in place.
    fn cleanup(&self, diffs: &mut Vec<Diff>) {
        cleanup_merge(diffs);
    }

    /// Build context hunks that turn `base` into the target of `diffs`.
    fn patch_make(&self, base: &str, diffs: &[Diff]) -> Vec<Patch>;

    /// Apply hunks to `text`, remapping every entry of `offsets`.
    fn patch_apply(&self, patches: &[Patch], text: &str, offsets: &[usize]) -> PatchOutcome;

    fn delta_encode(&self, diffs: &[Diff]) -> String {
        encode_delta(diffs)
    }

    fn delta_decode(&self, base: &str, delta: &str) -> Result<Vec<Diff>, DecodeError> {
        decode_delta(base, delta)
    }
}

// ───────────────────────────────────────────────────────────────────
// Free helpers
// ───────────────────────────────────────────────────────────────────

/// `true` if the diff describes no change at all.
pub fn is_unchanged(diffs: &[Diff]) -> bool {
    diffs.iter().all(|d| d.op == DiffOp::Equal)
}

/// Text the diff starts from (equal + deleted runs).
pub fn source_text(diffs: &[Diff]) -> String {
    diffs
        .iter()
        .filter(|d| d.op != DiffOp::Insert)
        .map(|d| d.text.as_str())
        .collect()
}

/// Text the diff produces (equal + inserted runs).
pub fn target_text(diffs: &[Diff]) -> String {
    diffs
        .iter()
        .filter(|d| d.op != DiffOp::Delete)
        .map(|d| d.text.as_str())
        .collect()
}

/// Merge adjacent runs of the same kind and drop empty runs.
///
/// Every stretch of edits between two equal runs becomes one delete
/// followed by one insert.
pub fn cleanup_merge(diffs: &mut Vec<Diff>) {
    fn flush(out: &mut Vec<Diff>, deleted: &mut String, inserted: &mut String) {
        if !deleted.is_empty() {
            out.push(Diff::delete(std::mem::take(deleted)));
        }
        if !inserted.is_empty() {
            out.push(Diff::insert(std::mem::take(inserted)));
        }
    }

    let mut merged: Vec<Diff> = Vec::with_capacity(diffs.len());
    let mut deleted = String::new();
    let mut inserted = String::new();

    for diff in diffs.drain(..) {
        match diff.op {
            DiffOp::Delete => deleted.push_str(&diff.text),
            DiffOp::Insert => inserted.push_str(&diff.text),
            DiffOp::Equal => {
                flush(&mut merged, &mut deleted, &mut inserted);
                if diff.text.is_empty() {
                    continue;
                }
                match merged.last_mut() {
                    Some(last) if last.op == DiffOp::Equal => last.text.push_str(&diff.text),
                    _ => merged.push(diff),
                }
            }
        }
    }
    flush(&mut merged, &mut deleted, &mut inserted);

    *diffs = merged;
}

/// Edit distance implied by a diff.
pub fn levenshtein(diffs: &[Diff]) -> usize {
    let mut distance = 0;
    let mut insertions = 0;
    let mut deletions = 0;
    for diff in diffs {
        match diff.op {
            DiffOp::Insert => insertions += diff.char_len(),
            DiffOp::Delete => deletions += diff.char_len(),
            DiffOp::Equal => {
                distance += insertions.max(deletions);
                insertions = 0;
                deletions = 0;
            }
        }
    }
    distance + insertions.max(deletions)
}

/// Map a location in the diff's source text to its target text.
pub fn x_index(diffs: &[Diff], loc: usize) -> usize {
    let mut chars1 = 0;
    let mut chars2 = 0;
    let mut last_chars1 = 0;
    let mut last_chars2 = 0;
    let mut hit = None;

    for diff in diffs {
        let len = diff.char_len();
        if diff.op != DiffOp::Insert {
            chars1 += len;
        }
        if diff.op != DiffOp::Delete {
            chars2 += len;
        }
        if chars1 > loc {
            hit = Some(diff.op);
            break;
        }
        last_chars1 = chars1;
        last_chars2 = chars2;
    }

    // Inside a deletion: collapse onto the deletion point.
    if hit == Some(DiffOp::Delete) {
        return last_chars2;
    }
    last_chars2 + (loc - last_chars1)
}

// Characters left verbatim by `encode_uri`, in their escaped form.
const URI_UNESCAPES: &[(&str, &str)] = &[
    ("%20", " "),
    ("%21", "!"),
    ("%2A", "*"),
    ("%27", "'"),
    ("%28", "("),
    ("%29", ")"),
    ("%3B", ";"),
    ("%2F", "/"),
    ("%3F", "?"),
    ("%3A", ":"),
    ("%40", "@"),
    ("%26", "&"),
    ("%3D", "="),
    ("%2B", "+"),
    ("%24", "$"),
    ("%2C", ","),
    ("%23", "#"),
];

/// Percent-escape text for a single wire line.
///
/// Newlines, tabs, `%` and non-ASCII are escaped; space and the URI
/// punctuation in `URI_UNESCAPES` stay readable.
pub fn encode_uri(text: &str) -> String {
    let mut encoded = urlencoding::encode(text).into_owned();
    for (escaped, raw) in URI_UNESCAPES {
        if encoded.contains(escaped) {
            encoded = encoded.replace(escaped, raw);
        }
    }
    encoded
}

/// Inverse of [`encode_uri`].
pub fn decode_uri(text: &str) -> Result<String, DecodeError> {
    urlencoding::decode(text)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| DecodeError::InvalidEscape(text.to_owned()))
}

/// Encode a diff as tab-separated `=N`, `-N`, `+text` tokens.
pub fn encode_delta(diffs: &[Diff]) -> String {
    diffs
        .iter()
        .map(|diff| match diff.op {
            DiffOp::Insert => format!("+{}", encode_uri(&diff.text)),
            DiffOp::Delete => format!("-{}", diff.char_len()),
            DiffOp::Equal => format!("={}", diff.char_len()),
        })
        .collect::<Vec<_>>()
        .join("\t")
}

/// Rebuild a diff from `base` and a delta produced by [`encode_delta`].
pub fn decode_delta(base: &str, delta: &str) -> Result<Vec<Diff>, DecodeError> {
    let base: Vec<char> = base.chars().collect();
    let mut diffs = Vec::new();
    let mut pointer = 0;

    for token in delta.split('\t') {
        let mut chars = token.chars();
        // Blank tokens are fine (trailing tab).
        let Some(op) = chars.next() else { continue };
        let param = chars.as_str();

        match op {
            '+' => diffs.push(Diff::insert(decode_uri(param)?)),
            '-' | '=' => {
                let n: usize = param
                    .parse()
                    .map_err(|_| DecodeError::InvalidLength(token.to_owned()))?;
                let end = pointer + n;
                if end > base.len() {
                    return Err(DecodeError::LengthMismatch {
                        consumed: end,
                        expected: base.len(),
                    });
                }
                let text: String = base[pointer..end].iter().collect();
                pointer = end;
                diffs.push(if op == '=' { Diff::equal(text) } else { Diff::delete(text) });
            }
            _ => return Err(DecodeError::InvalidOperation(token.to_owned())),
        }
    }

    if pointer != base.len() {
        return Err(DecodeError::LengthMismatch {
            consumed: pointer,
            expected: base.len(),
        });
    }
    Ok(diffs)
}

fn find_from(text: &[char], pattern: &[char], from: usize) -> Option<usize> {
    if pattern.is_empty() {
        return Some(from.min(text.len()));
    }
    if pattern.len() > text.len() {
        return None;
    }
    (from..=text.len() - pattern.len()).find(|&i| text[i..i + pattern.len()] == *pattern)
}

// Last occurrence starting at or before `upto`.
fn rfind_upto(text: &[char], pattern: &[char], upto: usize) -> Option<usize> {
    if pattern.is_empty() {
        return Some(upto.min(text.len()));
    }
    if pattern.len() > text.len() {
        return None;
    }
    let last = (text.len() - pattern.len()).min(upto);
    (0..=last).rev().find(|&i| text[i..i + pattern.len()] == *pattern)
}

/// Replace `remove` chars at `at` with `insert`, dragging offsets along.
///
/// Offsets past the edit shift by the net length change; offsets inside a
/// removed range collapse to `at`; offsets at or before `at` are untouched.
fn splice(chars: &mut Vec<char>, offsets: &mut [usize], at: usize, remove: usize, insert: &[char]) {
    let at = at.min(chars.len());
    let remove = remove.min(chars.len() - at);

    if remove > 0 {
        chars.drain(at..at + remove);
        for offset in offsets.iter_mut() {
            if *offset > at + remove {
                *offset -= remove;
            } else if *offset > at {
                *offset = at;
            }
        }
    }

    if !insert.is_empty() {
        chars.splice(at..at, insert.iter().copied());
        for offset in offsets.iter_mut() {
            if *offset > at {
                *offset += insert.len();
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Default implementation
// ───────────────────────────────────────────────────────────────────

/// Diff, patch and fuzzy-match tuning.
#[derive(Debug, Clone)]
pub struct DiffMatchPatch {
    /// Deadline for computing a diff; past it the result is valid but coarse.
    pub diff_timeout: Duration,
    /// 0.0 demands a perfect match, 1.0 accepts anything.
    pub match_threshold: f64,
    /// How far from the expected location a match may drift (chars).
    pub match_distance: usize,
    /// Longest pattern bitap searches in one go.
    pub match_max_bits: usize,
    /// Maximum error ratio tolerated when applying a long imperfect hunk.
    pub patch_delete_threshold: f64,
    /// Context characters around each hunk.
    pub patch_margin: usize,
}

impl Default for DiffMatchPatch {
    fn default() -> Self {
        Self {
            diff_timeout: Duration::from_millis(500),
            match_threshold: 0.5,
            match_distance: 1000,
            match_max_bits: 32,
            patch_delete_threshold: 0.5,
            patch_margin: 4,
        }
    }
}

impl DiffMatchPatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn max_bits(&self) -> usize {
        self.match_max_bits.clamp(1, 63)
    }

    /// Grow the hunk's context until its pattern is unique in `text`.
    fn add_context(&self, patch: &mut Patch, text: &[char]) {
        if text.is_empty() {
            return;
        }
        let margin = self.patch_margin;
        let start = patch.start2.min(text.len());
        let window = |padding: usize| {
            let lo = start.saturating_sub(padding);
            let hi = (start + patch.length1 + padding).min(text.len());
            (lo, hi.max(lo))
        };

        let mut padding = 0;
        let (mut lo, mut hi) = window(padding);
        while find_from(text, &text[lo..hi], 0) != rfind_upto(text, &text[lo..hi], text.len())
            && hi - lo < self.max_bits().saturating_sub(2 * margin)
        {
            padding += margin;
            (lo, hi) = window(padding);
        }
        padding += margin;

        let prefix: String = text[start.saturating_sub(padding)..start].iter().collect();
        let prefix_len = prefix.chars().count();
        if !prefix.is_empty() {
            patch.diffs.insert(0, Diff::equal(prefix));
        }

        let suffix_start = (start + patch.length1).min(text.len());
        let suffix_end = (suffix_start + padding).min(text.len());
        let suffix: String = text[suffix_start..suffix_end].iter().collect();
        let suffix_len = suffix_end - suffix_start;
        if !suffix.is_empty() {
            patch.diffs.push(Diff::equal(suffix));
        }

        patch.start1 -= prefix_len.min(patch.start1);
        patch.start2 -= prefix_len.min(patch.start2);
        patch.length1 += prefix_len + suffix_len;
        patch.length2 += prefix_len + suffix_len;
    }

    /// Pad the first and last hunk with sentinel characters so edits at the
    /// very edges of the text still have context to match against.
    fn add_padding(&self, patches: &mut [Patch]) -> Vec<char> {
        let pad = self.patch_margin;
        let padding: Vec<char> = (1..=pad as u32).filter_map(char::from_u32).collect();
        let pad = padding.len();

        for patch in patches.iter_mut() {
            patch.start1 += pad;
            patch.start2 += pad;
        }

        if let Some(first) = patches.first_mut() {
            let leading = match first.diffs.first() {
                Some(d) if d.op == DiffOp::Equal => Some(d.char_len()),
                _ => None,
            };
            match leading {
                None => {
                    first.diffs.insert(0, Diff::equal(padding.iter().collect::<String>()));
                    first.start1 -= pad;
                    first.start2 -= pad;
                    first.length1 += pad;
                    first.length2 += pad;
                }
                Some(len) if pad > len => {
                    let extra = pad - len;
                    let prefix: String = padding[len..].iter().collect();
                    first.diffs[0].text.insert_str(0, &prefix);
                    first.start1 -= extra;
                    first.start2 -= extra;
                    first.length1 += extra;
                    first.length2 += extra;
                }
                Some(_) => {}
            }
        }

        if let Some(last) = patches.last_mut() {
            let trailing = match last.diffs.last() {
                Some(d) if d.op == DiffOp::Equal => Some(d.char_len()),
                _ => None,
            };
            match trailing {
                None => {
                    last.diffs.push(Diff::equal(padding.iter().collect::<String>()));
                    last.length1 += pad;
                    last.length2 += pad;
                }
                Some(len) if pad > len => {
                    let extra = pad - len;
                    let suffix: String = padding[..extra].iter().collect();
                    if let Some(diff) = last.diffs.last_mut() {
                        diff.text.push_str(&suffix);
                    }
                    last.length1 += extra;
                    last.length2 += extra;
                }
                Some(_) => {}
            }
        }

        padding
    }

    fn bitap_score(&self, errors: usize, x: usize, loc: usize, pattern_len: usize) -> f64 {
        let accuracy = errors as f64 / pattern_len as f64;
        let proximity = loc.abs_diff(x);
        if self.match_distance == 0 {
            return if proximity == 0 { accuracy } else { 1.0 };
        }
        accuracy + proximity as f64 / self.match_distance as f64
    }

    /// Bitap search for the best fuzzy match of `pattern` near `loc`.
    fn match_bitap(&self, text: &[char], pattern: &[char], loc: usize) -> Option<usize> {
        let len = pattern.len();
        if len == 0 || len > self.max_bits() {
            return None;
        }

        let mut alphabet: HashMap<char, u64> = HashMap::new();
        for (i, c) in pattern.iter().enumerate() {
            *alphabet.entry(*c).or_insert(0) |= 1 << (len - i - 1);
        }

        let mut score_threshold = self.match_threshold;
        // Exact hits near `loc` tighten the threshold.
        if let Some(hit) = find_from(text, pattern, loc) {
            score_threshold = score_threshold.min(self.bitap_score(0, hit, loc, len));
            if let Some(hit) = rfind_upto(text, pattern, loc + len) {
                score_threshold = score_threshold.min(self.bitap_score(0, hit, loc, len));
            }
        }

        let match_mask: u64 = 1 << (len - 1);
        let mut best_loc = None;
        let mut bin_max = len + text.len();
        let mut last_rd: Vec<u64> = Vec::new();

        for d in 0..len {
            // Binary search for how far from `loc` we can stray at this error level.
            let mut bin_min = 0;
            let mut bin_mid = bin_max;
            while bin_min < bin_mid {
                if self.bitap_score(d, loc + bin_mid, loc, len) <= score_threshold {
                    bin_min = bin_mid;
                } else {
                    bin_max = bin_mid;
                }
                bin_mid = (bin_max - bin_min) / 2 + bin_min;
            }
            bin_max = bin_mid;

            let mut start = (loc as isize - bin_mid as isize + 1).max(1) as usize;
            let finish = (loc + bin_mid).min(text.len()) + len;

            let mut rd = vec![0u64; finish + 2];
            rd[finish + 1] = (1u64 << d) - 1;

            let mut j = finish;
            while j >= start {
                let char_match = text
                    .get(j - 1)
                    .and_then(|c| alphabet.get(c))
                    .copied()
                    .unwrap_or(0);
                rd[j] = if d == 0 {
                    ((rd[j + 1] << 1) | 1) & char_match
                } else {
                    (((rd[j + 1] << 1) | 1) & char_match)
                        | (((last_rd[j + 1] | last_rd[j]) << 1) | 1)
                        | last_rd[j + 1]
                };

                if rd[j] & match_mask != 0 {
                    let score = self.bitap_score(d, j - 1, loc, len);
                    if score <= score_threshold {
                        score_threshold = score;
                        best_loc = Some(j - 1);
                        if j - 1 > loc {
                            // Keep searching leftwards, but no further than we are right.
                            start = (2 * loc as isize - (j as isize - 1)).max(1) as usize;
                        } else {
                            break;
                        }
                    }
                }
                j -= 1;
            }

            if self.bitap_score(d + 1, loc, loc, len) > score_threshold {
                break;
            }
            last_rd = rd;
        }

        best_loc
    }

    /// Find where a hunk's source text sits in `text`, as `[start, end)`.
    fn locate(&self, text: &[char], pattern: &[char], expected: usize) -> Option<(usize, usize)> {
        let loc = expected.min(text.len());
        let len = pattern.len();
        if len == 0 {
            return Some((loc, loc));
        }

        if loc + len <= text.len() && text[loc..loc + len] == *pattern {
            return Some((loc, loc + len));
        }

        let nearest = [find_from(text, pattern, loc), rfind_upto(text, pattern, loc)]
            .into_iter()
            .flatten()
            .min_by_key(|hit| hit.abs_diff(loc));
        if let Some(hit) = nearest {
            if self.bitap_score(0, hit, loc, len) <= self.match_threshold {
                return Some((hit, hit + len));
            }
        }

        let max_bits = self.max_bits();
        if len <= max_bits {
            let start = self.match_bitap(text, pattern, loc)?;
            return Some((start, (start + len).min(text.len())));
        }

        // Long hunk: anchor head and tail separately.
        let start = self.match_bitap(text, &pattern[..max_bits], loc)?;
        let end = self.match_bitap(text, &pattern[len - max_bits..], loc + len - max_bits)?;
        if start >= end {
            return None;
        }
        Some((start, (end + max_bits).min(text.len())))
    }
}

impl TextDiffPatch for DiffMatchPatch {
    fn diff(&self, a: &str, b: &str) -> Vec<Diff> {
        let diff = TextDiff::configure()
            .timeout(self.diff_timeout)
            .diff_chars(a, b);

        let mut diffs: Vec<Diff> = Vec::new();
        for change in diff.iter_all_changes() {
            let op = match change.tag() {
                ChangeTag::Equal => DiffOp::Equal,
                ChangeTag::Insert => DiffOp::Insert,
                ChangeTag::Delete => DiffOp::Delete,
            };
            match diffs.last_mut() {
                Some(last) if last.op == op => last.text.push_str(change.value()),
                _ => diffs.push(Diff::new(op, change.value())),
            }
        }
        cleanup_merge(&mut diffs);
        diffs
    }

    fn patch_make(&self, base: &str, diffs: &[Diff]) -> Vec<Patch> {
        let mut patches = Vec::new();
        if diffs.is_empty() {
            return patches;
        }

        let margin = self.patch_margin;
        let mut patch = Patch::default();
        let mut count1 = 0;
        let mut count2 = 0;
        // `prepatch` is the text the current hunk's context is taken from;
        // `postpatch` tracks the text with all hunks so far applied.
        let mut prepatch: Vec<char> = base.chars().collect();
        let mut postpatch = prepatch.clone();
        let last = diffs.len() - 1;

        for (i, diff) in diffs.iter().enumerate() {
            let chars: Vec<char> = diff.text.chars().collect();
            let len = chars.len();

            if patch.diffs.is_empty() && diff.op != DiffOp::Equal {
                patch.start1 = count1;
                patch.start2 = count2;
            }

            match diff.op {
                DiffOp::Insert => {
                    patch.diffs.push(diff.clone());
                    patch.length2 += len;
                    let at = count2.min(postpatch.len());
                    postpatch.splice(at..at, chars);
                }
                DiffOp::Delete => {
                    patch.length1 += len;
                    patch.diffs.push(diff.clone());
                    let end = (count2 + len).min(postpatch.len());
                    postpatch.drain(count2.min(end)..end);
                }
                DiffOp::Equal => {
                    if len <= 2 * margin && !patch.diffs.is_empty() && i != last {
                        // Small equality inside a hunk.
                        patch.diffs.push(diff.clone());
                        patch.length1 += len;
                        patch.length2 += len;
                    } else if len >= 2 * margin && !patch.diffs.is_empty() {
                        // Large equality closes the hunk.
                        self.add_context(&mut patch, &prepatch);
                        patches.push(std::mem::take(&mut patch));
                        prepatch = postpatch.clone();
                        count1 = count2;
                    }
                }
            }

            if diff.op != DiffOp::Insert {
                count1 += len;
            }
            if diff.op != DiffOp::Delete {
                count2 += len;
            }
        }

        if !patch.diffs.is_empty() {
            self.add_context(&mut patch, &prepatch);
            patches.push(patch);
        }
        patches
    }

    fn patch_apply(&self, patches: &[Patch], text: &str, offsets: &[usize]) -> PatchOutcome {
        if patches.is_empty() {
            return PatchOutcome {
                text: text.to_owned(),
                applied: Vec::new(),
                offsets: offsets.to_vec(),
            };
        }

        let mut patches = patches.to_vec();
        let padding = self.add_padding(&mut patches);
        let pad = padding.len();
        let text_len = text.chars().count();

        let mut chars: Vec<char> = padding
            .iter()
            .copied()
            .chain(text.chars())
            .chain(padding.iter().copied())
            .collect();
        let mut offsets: Vec<usize> = offsets.iter().map(|&o| o.min(text_len) + pad).collect();

        let max_bits = self.max_bits();
        let mut applied = Vec::with_capacity(patches.len());
        // Drift between where hunks were expected and where they matched.
        let mut delta: isize = 0;

        for patch in &patches {
            let expected = (patch.start2 as isize + delta).max(0) as usize;
            let text1: Vec<char> = source_text(&patch.diffs).chars().collect();

            let Some((start, end)) = self.locate(&chars, &text1, expected) else {
                log::debug!("patch at {} not located", patch.start2);
                applied.push(false);
                delta -= patch.length2 as isize - patch.length1 as isize;
                continue;
            };
            delta = start as isize - expected as isize;
            let text2: Vec<char> = chars[start..end].to_vec();

            if text1 == text2 {
                let mut pos = start;
                for diff in &patch.diffs {
                    let piece: Vec<char> = diff.text.chars().collect();
                    match diff.op {
                        DiffOp::Equal => pos += piece.len(),
                        DiffOp::Delete => splice(&mut chars, &mut offsets, pos, piece.len(), &[]),
                        DiffOp::Insert => {
                            splice(&mut chars, &mut offsets, pos, 0, &piece);
                            pos += piece.len();
                        }
                    }
                }
                applied.push(true);
                continue;
            }

            // Imperfect match: map hunk positions through a diff of the two texts.
            let source: String = text1.iter().collect();
            let found: String = text2.iter().collect();
            let diffs = self.diff(&source, &found);
            if text1.len() > max_bits
                && levenshtein(&diffs) as f64 / text1.len() as f64 > self.patch_delete_threshold
            {
                applied.push(false);
                continue;
            }

            let mut index1 = 0;
            for diff in &patch.diffs {
                let piece: Vec<char> = diff.text.chars().collect();
                match diff.op {
                    DiffOp::Equal => {}
                    DiffOp::Insert => {
                        let index2 = x_index(&diffs, index1);
                        splice(&mut chars, &mut offsets, start + index2, 0, &piece);
                    }
                    DiffOp::Delete => {
                        let index2 = x_index(&diffs, index1);
                        let end2 = x_index(&diffs, index1 + piece.len()).max(index2);
                        splice(&mut chars, &mut offsets, start + index2, end2 - index2, &[]);
                    }
                }
                if diff.op != DiffOp::Delete {
                    index1 += piece.len();
                }
            }
            applied.push(true);
        }

        let end = chars.len().saturating_sub(pad);
        let begin = pad.min(end);
        let body_len = end - begin;
        PatchOutcome {
            text: chars[begin..end].iter().collect(),
            applied,
            offsets: offsets
                .into_iter()
                .map(|o| o.saturating_sub(pad).min(body_len))
                .collect(),
        }
    }
}
