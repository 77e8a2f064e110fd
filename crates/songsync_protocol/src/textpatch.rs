//! Character-level text diff and patch codec.
//!
//! A [`TextPatch`] is a list of hunks. Each hunk carries up to
//! [`CONTEXT_MARGIN`] characters of unchanged context on either side of a
//! change, so it can still be placed when the base text has drifted.
//!
//! # Text form
//!
//! ```text
//! @@ -4,9 +4,11 @@
//!  ng G
//! -r
//! +R
//!  ace
//! ```
//!
//! Offsets and lengths count characters, not bytes. Edit bodies escape `%`,
//! `\n` and `\r` as `%25`, `%0A` and `%0D`. The empty patch is the empty
//! string.

use crate::error::{ProtocolError, ProtocolResult};
use std::fmt;

/// Characters of unchanged context kept around each change.
pub const CONTEXT_MARGIN: usize = 4;

/// Maximum edit distance explored by the diff before it falls back to a
/// whole-range replacement of the differing middle section.
pub const MAX_EDIT_DISTANCE: usize = 1024;

/// Maximum distance a hunk may be moved from its expected position when
/// its context no longer matches.
pub const FUZZY_DISTANCE: usize = 1000;

/// A single diff operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Text present in both versions.
    Equal(String),
    /// Text only present in the old version.
    Delete(String),
    /// Text only present in the new version.
    Insert(String),
}

impl Edit {
    /// Returns the text carried by the edit.
    pub fn text(&self) -> &str {
        match self {
            Edit::Equal(t) | Edit::Delete(t) | Edit::Insert(t) => t,
        }
    }

    fn char_len(&self) -> usize {
        self.text().chars().count()
    }

    fn kind(&self) -> Kind {
        match self {
            Edit::Equal(_) => Kind::Equal,
            Edit::Delete(_) => Kind::Delete,
            Edit::Insert(_) => Kind::Insert,
        }
    }

    fn text_mut(&mut self) -> &mut String {
        match self {
            Edit::Equal(t) | Edit::Delete(t) | Edit::Insert(t) => t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Equal,
    Delete,
    Insert,
}

impl Kind {
    fn edit(self, text: String) -> Edit {
        match self {
            Kind::Equal => Edit::Equal(text),
            Kind::Delete => Edit::Delete(text),
            Kind::Insert => Edit::Insert(text),
        }
    }
}

/// Collects edits, merging neighbours of the same kind.
#[derive(Default)]
struct EditList {
    edits: Vec<Edit>,
}

impl EditList {
    fn push_char(&mut self, kind: Kind, c: char) {
        match self.edits.last_mut() {
            Some(last) if last.kind() == kind => last.text_mut().push(c),
            _ => self.edits.push(kind.edit(c.to_string())),
        }
    }

    fn push_chars(&mut self, kind: Kind, chars: &[char]) {
        for &c in chars {
            self.push_char(kind, c);
        }
    }

    fn push(&mut self, edit: Edit) {
        if edit.text().is_empty() {
            return;
        }
        match self.edits.last_mut() {
            Some(last) if last.kind() == edit.kind() => last.text_mut().push_str(edit.text()),
            _ => self.edits.push(edit),
        }
    }
}

/// Computes the character-level edit script turning `old` into `new`.
pub fn diff(old: &str, new: &str) -> Vec<Edit> {
    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();

    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let mut out = EditList::default();
    out.push_chars(Kind::Equal, &a[..prefix]);
    diff_middle(&a[prefix..a.len() - suffix], &b[prefix..b.len() - suffix], &mut out);
    out.push_chars(Kind::Equal, &a[a.len() - suffix..]);
    out.edits
}

fn diff_middle(a: &[char], b: &[char], out: &mut EditList) {
    if a.is_empty() {
        out.push_chars(Kind::Insert, b);
        return;
    }
    if b.is_empty() {
        out.push_chars(Kind::Delete, a);
        return;
    }
    match myers(a, b) {
        Some(script) => {
            for (kind, c) in script {
                out.push_char(kind, c);
            }
        }
        None => {
            out.push_chars(Kind::Delete, a);
            out.push_chars(Kind::Insert, b);
        }
    }
}

/// Greedy Myers shortest edit script. Returns `None` when the edit
/// distance exceeds [`MAX_EDIT_DISTANCE`].
fn myers(a: &[char], b: &[char]) -> Option<Vec<(Kind, char)>> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max_d = (a.len() + b.len()).min(MAX_EDIT_DISTANCE) as isize;
    let offset = max_d + 1;
    let mut v = vec![0isize; (2 * offset + 1) as usize];
    // trace[d] holds the furthest x per diagonal k in -(d-1)..=(d-1) before round d.
    let mut trace: Vec<Vec<isize>> = Vec::new();

    for d in 0..=max_d {
        if d == 0 {
            trace.push(Vec::new());
        } else {
            trace.push(v[(offset - d + 1) as usize..=(offset + d - 1) as usize].to_vec());
        }

        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                return Some(backtrack(a, b, &trace, d));
            }
            k += 2;
        }
    }
    None
}

fn trace_at(v: &[isize], d: isize, k: isize) -> isize {
    v[(k + d - 1) as usize]
}

fn backtrack(a: &[char], b: &[char], trace: &[Vec<isize>], d_final: isize) -> Vec<(Kind, char)> {
    let mut script = Vec::new();
    let mut x = a.len() as isize;
    let mut y = b.len() as isize;

    let mut d = d_final;
    while d > 0 {
        let v = &trace[d as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && trace_at(v, d, k - 1) < trace_at(v, d, k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = trace_at(v, d, prev_k);
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            x -= 1;
            y -= 1;
            script.push((Kind::Equal, a[x as usize]));
        }
        if x == prev_x {
            y -= 1;
            script.push((Kind::Insert, b[y as usize]));
        } else {
            x -= 1;
            script.push((Kind::Delete, a[x as usize]));
        }
        d -= 1;
    }
    while x > 0 && y > 0 {
        x -= 1;
        y -= 1;
        script.push((Kind::Equal, a[x as usize]));
    }

    script.reverse();
    script
}

/// One located change with its surrounding context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// Character offset in the old text.
    pub start1: usize,
    /// Character offset in the new text.
    pub start2: usize,
    /// Characters consumed from the old text.
    pub length1: usize,
    /// Characters produced in the new text.
    pub length2: usize,
    /// Context and change edits, in order.
    pub edits: Vec<Edit>,
}

impl Hunk {
    fn new(start1: usize, start2: usize, edits: Vec<Edit>) -> Self {
        let mut hunk = Self {
            start1,
            start2,
            length1: 0,
            length2: 0,
            edits,
        };
        hunk.length1 = hunk.source().chars().count();
        hunk.length2 = hunk.target().chars().count();
        hunk
    }

    /// Text this hunk expects to find: context plus deletions.
    pub fn source(&self) -> String {
        Self::join(&self.edits, |e| !matches!(e, Edit::Insert(_)))
    }

    /// Text this hunk produces: context plus insertions.
    pub fn target(&self) -> String {
        Self::join(&self.edits, |e| !matches!(e, Edit::Delete(_)))
    }

    fn join(edits: &[Edit], keep: impl Fn(&Edit) -> bool) -> String {
        edits
            .iter()
            .filter(|e| keep(e))
            .map(Edit::text)
            .collect()
    }

    /// Splits the edits into leading context, core and trailing context.
    fn split_context(&self) -> (&str, &[Edit], &str) {
        let mut core = &self.edits[..];
        let mut pre = "";
        let mut post = "";
        if let Some((Edit::Equal(t), rest)) = core.split_first() {
            pre = t;
            core = rest;
        }
        if let Some((Edit::Equal(t), rest)) = core.split_last() {
            post = t;
            core = rest;
        }
        (pre, core, post)
    }
}

/// Result of applying a [`TextPatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    /// The patched text.
    pub text: String,
    /// Per-hunk flag: `true` if the hunk was placed.
    pub applied: Vec<bool>,
}

impl PatchOutcome {
    /// Returns true if every hunk was placed.
    pub fn is_clean(&self) -> bool {
        self.applied.iter().all(|a| *a)
    }
}

/// A textual patch between two strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextPatch {
    hunks: Vec<Hunk>,
}

struct HunkBuilder {
    start1: usize,
    start2: usize,
    edits: EditList,
}

impl HunkBuilder {
    fn push(&mut self, edit: Edit) {
        self.edits.push(edit);
    }

    fn finish(self) -> Hunk {
        Hunk::new(self.start1, self.start2, self.edits.edits)
    }
}

struct Placement {
    at: usize,
    remove: usize,
    insert: Vec<char>,
    anchor: isize,
}

impl TextPatch {
    /// Computes the patch turning `old` into `new`.
    pub fn make(old: &str, new: &str) -> Self {
        let edits = diff(old, new);
        let old_chars: Vec<char> = old.chars().collect();
        let last = edits.len().saturating_sub(1);

        let mut hunks = Vec::new();
        let mut current: Option<HunkBuilder> = None;
        let mut pos1 = 0usize;
        let mut pos2 = 0usize;

        for (i, edit) in edits.into_iter().enumerate() {
            let len = edit.char_len();
            match edit {
                Edit::Equal(text) => {
                    if let Some(mut builder) = current.take() {
                        if len <= 2 * CONTEXT_MARGIN && i != last {
                            builder.push(Edit::Equal(text));
                            current = Some(builder);
                        } else {
                            builder.push(Edit::Equal(text.chars().take(CONTEXT_MARGIN).collect()));
                            hunks.push(builder.finish());
                        }
                    }
                    pos1 += len;
                    pos2 += len;
                }
                change => {
                    let builder = current.get_or_insert_with(|| {
                        let pre_start = pos1.saturating_sub(CONTEXT_MARGIN);
                        let pre_len = pos1 - pre_start;
                        let mut edits = EditList::default();
                        edits.push_chars(Kind::Equal, &old_chars[pre_start..pos1]);
                        HunkBuilder {
                            start1: pos1 - pre_len,
                            start2: pos2 - pre_len,
                            edits,
                        }
                    });
                    if matches!(change, Edit::Delete(_)) {
                        pos1 += len;
                    } else {
                        pos2 += len;
                    }
                    builder.push(change);
                }
            }
        }
        if let Some(builder) = current {
            hunks.push(builder.finish());
        }

        Self { hunks }
    }

    /// Returns true if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Returns the hunks.
    pub fn hunks(&self) -> &[Hunk] {
        &self.hunks
    }

    /// Parses the text form produced by [`fmt::Display`].
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        let mut hunks = Vec::new();
        let mut current: Option<(usize, usize, usize, usize, Vec<Edit>)> = None;

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix("@@ ") {
                if let Some(h) = current.take() {
                    hunks.push(Self::close_hunk(h, line_no)?);
                }
                let (s1, l1, s2, l2) = parse_header(header, line_no)?;
                current = Some((s1, l1, s2, l2, Vec::new()));
                continue;
            }

            let (_, _, _, _, edits) = current
                .as_mut()
                .ok_or_else(|| ProtocolError::malformed_patch(line_no, "edit before hunk header"))?;
            let mut chars = line.chars();
            let sign = chars.next();
            let body = unescape(chars.as_str(), line_no)?;
            let edit = match sign {
                Some(' ') => Edit::Equal(body),
                Some('-') => Edit::Delete(body),
                Some('+') => Edit::Insert(body),
                other => {
                    return Err(ProtocolError::malformed_patch(
                        line_no,
                        format!("unknown edit marker {other:?}"),
                    ))
                }
            };
            edits.push(edit);
        }
        if let Some(h) = current.take() {
            hunks.push(Self::close_hunk(h, text.lines().count())?);
        }

        Ok(Self { hunks })
    }

    fn close_hunk(
        (start1, length1, start2, length2, edits): (usize, usize, usize, usize, Vec<Edit>),
        line_no: usize,
    ) -> ProtocolResult<Hunk> {
        let hunk = Hunk::new(start1, start2, edits);
        if hunk.length1 != length1 || hunk.length2 != length2 {
            return Err(ProtocolError::malformed_patch(
                line_no,
                format!(
                    "hunk lengths {},{} do not match header {},{}",
                    hunk.length1, hunk.length2, length1, length2
                ),
            ));
        }
        Ok(hunk)
    }

    /// Applies the patch to `base`.
    ///
    /// Never fails: hunks whose context cannot be located are skipped and
    /// reported in [`PatchOutcome::applied`].
    pub fn apply(&self, base: &str) -> PatchOutcome {
        let mut text: Vec<char> = base.chars().collect();
        let mut applied = Vec::with_capacity(self.hunks.len());
        let mut delta: isize = 0;

        for hunk in &self.hunks {
            let expected = (hunk.start2 as isize + delta).clamp(0, text.len() as isize) as usize;
            match Self::place(&text, hunk, expected) {
                Some(placement) => {
                    let end = placement.at + placement.remove;
                    text.splice(placement.at..end, placement.insert);
                    delta = placement.anchor - hunk.start2 as isize;
                    applied.push(true);
                }
                None => {
                    delta -= hunk.length2 as isize - hunk.length1 as isize;
                    applied.push(false);
                }
            }
        }

        PatchOutcome {
            text: text.into_iter().collect(),
            applied,
        }
    }

    fn place(text: &[char], hunk: &Hunk, expected: usize) -> Option<Placement> {
        let source: Vec<char> = hunk.source().chars().collect();
        let target: Vec<char> = hunk.target().chars().collect();

        if source.is_empty() {
            return Some(Placement {
                at: expected,
                remove: 0,
                insert: target,
                anchor: expected as isize,
            });
        }
        if let Some(at) = find_nearest(text, &source, expected, usize::MAX) {
            return Some(Placement {
                at,
                remove: source.len(),
                insert: target,
                anchor: at as isize,
            });
        }

        // Context drifted: place the core of the hunk on its own.
        let (pre, core, post) = hunk.split_context();
        let pre: Vec<char> = pre.chars().collect();
        let post: Vec<char> = post.chars().collect();
        let core_source: Vec<char> = Hunk::join(core, |e| !matches!(e, Edit::Insert(_)))
            .chars()
            .collect();
        let core_target: Vec<char> = Hunk::join(core, |e| !matches!(e, Edit::Delete(_)))
            .chars()
            .collect();

        let at = if !core_source.is_empty() {
            find_nearest(text, &core_source, expected + pre.len(), FUZZY_DISTANCE)?
        } else if !pre.is_empty() {
            find_nearest(text, &pre, expected, FUZZY_DISTANCE)? + pre.len()
        } else if !post.is_empty() {
            find_nearest(text, &post, expected, FUZZY_DISTANCE)?
        } else {
            return None;
        };

        Some(Placement {
            at,
            remove: core_source.len(),
            insert: core_target,
            anchor: at as isize - pre.len() as isize,
        })
    }
}

impl fmt::Display for TextPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for hunk in &self.hunks {
            writeln!(
                f,
                "@@ -{},{} +{},{} @@",
                hunk.start1, hunk.length1, hunk.start2, hunk.length2
            )?;
            for edit in &hunk.edits {
                let sign = match edit {
                    Edit::Equal(_) => ' ',
                    Edit::Delete(_) => '-',
                    Edit::Insert(_) => '+',
                };
                writeln!(f, "{sign}{}", escape(edit.text()))?;
            }
        }
        Ok(())
    }
}

/// Occurrence of `needle` in `hay` closest to `expected`, within `max_distance`.
fn find_nearest(hay: &[char], needle: &[char], expected: usize, max_distance: usize) -> Option<usize> {
    if needle.is_empty() || needle.len() > hay.len() {
        return None;
    }
    let mut best: Option<(usize, usize)> = None;
    for start in 0..=hay.len() - needle.len() {
        let distance = start.abs_diff(expected);
        if let Some((_, best_distance)) = best {
            if start > expected && distance >= best_distance {
                break;
            }
        }
        if distance <= max_distance
            && hay[start..start + needle.len()] == *needle
            && best.map_or(true, |(_, d)| distance < d)
        {
            best = Some((start, distance));
        }
    }
    best.map(|(start, _)| start)
}

fn parse_header(header: &str, line_no: usize) -> ProtocolResult<(usize, usize, usize, usize)> {
    let err = |msg: &str| ProtocolError::malformed_patch(line_no, msg);
    let body = header
        .strip_suffix(" @@")
        .ok_or_else(|| err("hunk header must end with @@"))?;
    let mut parts = body.split(' ');
    let old = parts
        .next()
        .and_then(|p| p.strip_prefix('-'))
        .ok_or_else(|| err("missing old range"))?;
    let new = parts
        .next()
        .and_then(|p| p.strip_prefix('+'))
        .ok_or_else(|| err("missing new range"))?;
    if parts.next().is_some() {
        return Err(err("trailing data in hunk header"));
    }
    let range = |r: &str| -> ProtocolResult<(usize, usize)> {
        let (start, len) = r.split_once(',').ok_or_else(|| err("range needs start,length"))?;
        let start = start.parse().map_err(|_| err("invalid range start"))?;
        let len = len.parse().map_err(|_| err("invalid range length"))?;
        Ok((start, len))
    };
    let (s1, l1) = range(old)?;
    let (s2, l2) = range(new)?;
    Ok((s1, l1, s2, l2))
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '%' => out.push_str("%25"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(text: &str, line_no: usize) -> ProtocolResult<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let code: String = chars.by_ref().take(2).collect();
        match code.as_str() {
            "25" => out.push('%'),
            "0A" => out.push('\n'),
            "0D" => out.push('\r'),
            other => {
                return Err(ProtocolError::malformed_patch(
                    line_no,
                    format!("invalid escape %{other}"),
                ))
            }
        }
    }
    Ok(out)
}

/// Computes the text form of the patch from `old` to `new`.
///
/// Returns the empty string when nothing changed.
pub fn make_patch_text(old: &str, new: &str) -> String {
    TextPatch::make(old, new).to_string()
}

/// Parses `patch` and applies it to `base`.
pub fn apply_patch_text(base: &str, patch: &str) -> ProtocolResult<PatchOutcome> {
    Ok(TextPatch::parse(patch)?.apply(base))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(old: &str, new: &str) {
        let text = make_patch_text(old, new);
        let outcome = apply_patch_text(old, &text).unwrap();
        assert_eq!(outcome.text, new, "patch:\n{text}");
        assert!(outcome.is_clean());
    }

    #[test]
    fn diff_basic() {
        let edits = diff("Amazing Grace", "Amazing Race");
        let rebuilt_old: String = edits
            .iter()
            .filter(|e| !matches!(e, Edit::Insert(_)))
            .map(Edit::text)
            .collect();
        let rebuilt_new: String = edits
            .iter()
            .filter(|e| !matches!(e, Edit::Delete(_)))
            .map(Edit::text)
            .collect();
        assert_eq!(rebuilt_old, "Amazing Grace");
        assert_eq!(rebuilt_new, "Amazing Race");
        assert_eq!(edits.first(), Some(&Edit::Equal("Amazing ".into())));
    }

    #[test]
    fn identical_texts_give_empty_patch() {
        assert!(TextPatch::make("same", "same").is_empty());
        assert_eq!(make_patch_text("", ""), "");
        assert_eq!(make_patch_text("x", "x"), "");
    }

    #[test]
    fn roundtrips() {
        roundtrip("", "Amazing Grace");
        roundtrip("Amazing Grace", "");
        roundtrip("Amazing Grace", "Amazing Grace, how sweet the sound");
        roundtrip("abc", "xyz");
        roundtrip("line 1\nline 2\n", "line 1\nline two\nline 3\n");
        roundtrip("100% sure", "50% sure\r\n");
        roundtrip("Grüße, Ölberg", "Grüße vom Ölberg ♪");
        roundtrip(
            "The quick brown fox jumps over the lazy dog",
            "That quick brown cat jumped over a lazy dog!",
        );
    }

    #[test]
    fn text_form_roundtrip() {
        let patch = TextPatch::make("Amazing Grace", "Amazing Race\n%");
        let parsed = TextPatch::parse(&patch.to_string()).unwrap();
        assert_eq!(parsed, patch);
    }

    #[test]
    fn header_is_character_based() {
        let patch = TextPatch::make("ääää", "ääöää");
        let hunk = &patch.hunks()[0];
        assert_eq!(hunk.start1, 0);
        assert_eq!(hunk.length1, 4);
        assert_eq!(hunk.length2, 5);
    }

    #[test]
    fn apply_tolerates_drifted_base() {
        let patch = TextPatch::make(
            "Verse one\nChorus line\nVerse two",
            "Verse one\nChorus LINE\nVerse two",
        );
        let outcome = patch.apply("Intro\nVerse one\nChorus line\nVerse two");
        assert!(outcome.is_clean());
        assert_eq!(outcome.text, "Intro\nVerse one\nChorus LINE\nVerse two");
    }

    #[test]
    fn apply_reports_unplaceable_hunks() {
        let patch = TextPatch::make("hello world", "hello there world");
        let outcome = patch.apply("completely different");
        assert_eq!(outcome.applied, vec![false]);
        assert_eq!(outcome.text, "completely different");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(TextPatch::parse("+orphan").is_err());
        assert!(TextPatch::parse("@@ -0,1 +0,1\n x").is_err());
        assert!(TextPatch::parse("@@ -0,1 +0,1 @@\n*x").is_err());
        assert!(TextPatch::parse("@@ -0,1 +0,1 @@\n %zz").is_err());
        assert!(TextPatch::parse("@@ -0,5 +0,1 @@\n x").is_err());
        assert!(TextPatch::parse("").unwrap().is_empty());
    }

    #[test]
    fn multiple_hunks() {
        let old = "aaaaaaaaaaaaaaaaaaaa1bbbbbbbbbbbbbbbbbbbbbb2cccccccccccccc";
        let new = "aaaaaaaaaaaaaaaaaaaaXbbbbbbbbbbbbbbbbbbbbbbYYcccccccccccccc";
        let patch = TextPatch::make(old, new);
        assert_eq!(patch.hunks().len(), 2);
        roundtrip(old, new);
    }

    #[test]
    fn large_rewrite_falls_back_to_replacement() {
        let old: String = (0..3000).map(|i| if i % 2 == 0 { 'a' } else { 'b' }).collect();
        let new: String = (0..3000).map(|i| if i % 3 == 0 { 'c' } else { 'd' }).collect();
        roundtrip(&old, &new);
    }
}
