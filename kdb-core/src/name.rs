//! The name codec: escaping, unescaping, canonicalisation and namespace
//! classification (spec §4.1, §6.1, §6.2).
//!
//! A name has two representations that travel together everywhere in this
//! crate: the *canonical* escaped form (what callers type and what gets
//! stored) and the *unescaped* form (a sequence of NUL-terminated raw
//! segments used as the sort key). [`Name`] owns both; [`UnescapedNameBuf`]
//! and [`UnescapedName`] are the owned/borrowed split of the unescaped form
//! alone, mirroring how a path and its buffer are split in the teacher's
//! `Path`/`PathBuf`.

use crate::error::{KdbError, Result};

/// The top-level partition a name belongs to (spec §3).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Namespace {
    /// No name has been set on the key yet.
    Empty,
    /// A name beginning with `/`, resolved across concrete namespaces at
    /// lookup time (spec §4.3).
    Cascading,
    /// A bare name with no recognised namespace prefix. Used for keys
    /// attached as metadata on another key.
    Meta,
    Spec,
    Proc,
    Dir,
    /// `user` or `user:owner`. The owner is carried for informational
    /// purposes only; it is not part of the unescaped sort key (see
    /// DESIGN.md).
    User(Option<String>),
    System,
    Default,
}

impl Namespace {
    /// The literal bytes used as the first, namespace-identifying segment
    /// of the unescaped form (spec §6.2).
    fn token(&self) -> &'static [u8] {
        match self {
            Namespace::Empty => b"",
            Namespace::Cascading => b"/",
            Namespace::Meta => b"meta",
            Namespace::Spec => b"spec",
            Namespace::Proc => b"proc",
            Namespace::Dir => b"dir",
            Namespace::User(_) => b"user",
            Namespace::System => b"system",
            Namespace::Default => b"default",
        }
    }

    /// The namespace's keyword as it appears in a canonical name, without
    /// an owner suffix.
    fn keyword(&self) -> &'static str {
        std::str::from_utf8(self.token()).unwrap()
    }
}

/// The fixed probing order for cascading lookups (spec §4.3).
pub const CASCADE_ORDER: [fn() -> Namespace; 6] = [
    || Namespace::Spec,
    || Namespace::Proc,
    || Namespace::Dir,
    || Namespace::User(None),
    || Namespace::System,
    || Namespace::Default,
];

/// Classifies a name by its first segment, without validating the rest of
/// it (spec §4.1 `Classify`).
pub fn classify(name: &str) -> Namespace {
    if name.is_empty() {
        return Namespace::Empty;
    }
    if name.starts_with('/') {
        return Namespace::Cascading;
    }
    let head = name.split('/').next().unwrap_or(name);
    if let Some((kw, owner)) = head.split_once(':') {
        return if kw == "user" {
            Namespace::User(Some(owner.to_string()))
        } else {
            Namespace::Meta
        };
    }
    match head {
        "spec" => Namespace::Spec,
        "proc" => Namespace::Proc,
        "dir" => Namespace::Dir,
        "user" => Namespace::User(None),
        "system" => Namespace::System,
        "default" => Namespace::Default,
        _ => Namespace::Meta,
    }
}

/// Splits the part of a name following its namespace prefix into escaped,
/// still-encoded one-level tokens, collapsing runs of unescaped `/`
/// (spec §4.1 `One-level`).
fn split_escaped(region: &str) -> Vec<&str> {
    let bytes = region.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'/' {
            let mut backslashes = 0usize;
            let mut j = i;
            while j > start && bytes[j - 1] == b'\\' {
                backslashes += 1;
                j -= 1;
            }
            if backslashes % 2 == 0 {
                if i > start {
                    parts.push(&region[start..i]);
                }
                start = i + 1;
            }
        }
        i += 1;
    }
    if start < bytes.len() {
        parts.push(&region[start..]);
    }
    parts
}

/// Unescapes a single one-level token into its raw segment value
/// (spec §4.1).
fn unescape_part(part: &str) -> String {
    if part == "%" {
        return String::new();
    }
    let mut out = String::with_capacity(part.len());
    let mut chars = part.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                // A trailing stray escape is only ever permitted as the
                // last byte of the full name; keep it literally.
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Escapes a single raw segment into its canonical one-level token
/// (spec §4.1 `Escape-part`). Idempotent: `escape_part(unescape_part(x)) ==
/// x` for any canonical token `x`.
pub fn escape_part(raw: &str) -> String {
    if raw.is_empty() {
        return "%".to_string();
    }
    if raw == "." {
        return "\\.".to_string();
    }
    if raw == ".." {
        return "\\..".to_string();
    }
    let mut out = String::with_capacity(raw.len() + 2);
    if raw.starts_with('%') {
        out.push('\\');
    }
    for c in raw.chars() {
        if c == '\\' || c == '/' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// The parsed, canonical form of a name: namespace, canonical escaped
/// string and unescaped sort-key buffer, built together so they can never
/// drift apart (spec §3 invariant I2).
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct Name {
    canonical: String,
    unescaped: UnescapedNameBuf,
    namespace: Namespace,
}

impl Name {
    /// The empty name: namespace `Empty`, unescaped size 0, escaped size 1
    /// (a lone NUL byte) — spec §8 boundary behavior.
    pub fn empty() -> Self {
        Name {
            canonical: "\u{0}".to_string(),
            unescaped: UnescapedNameBuf::new(),
            namespace: Namespace::Empty,
        }
    }

    /// Canonicalises `input` and builds a [`Name`] from it (spec §4.1
    /// `Canonicalise`).
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Ok(Self::empty());
        }
        if input.contains('\0') {
            return Err(KdbError::InvalidName("embedded NUL".to_string()));
        }
        let namespace = classify(input);
        reject_colon_on_non_user_namespace(input)?;

        let region: &str = match &namespace {
            Namespace::Cascading => &input[1..],
            Namespace::Meta => input,
            Namespace::Spec
            | Namespace::Proc
            | Namespace::Dir
            | Namespace::System
            | Namespace::Default => strip_prefix_region(input, namespace.keyword())?,
            Namespace::User(owner) => {
                let head_len = 4 + owner.as_ref().map(|o| 1 + o.len()).unwrap_or(0);
                strip_prefix_region(input, &input[..head_len])?
            }
            Namespace::Empty => "",
        };

        let segments = canonicalise_segments(input, &namespace, region)?;
        Ok(Name::from_parts(namespace, segments))
    }

    /// Builds a [`Name`] directly from an already-classified namespace and
    /// already-canonicalised raw segments, without reparsing. Used by
    /// `parse` and by [`Key::add_name`](crate::key::Key::add_name), which
    /// must rebuild a name's tail without ever touching its namespace.
    fn from_parts(namespace: Namespace, segments: Vec<String>) -> Self {
        let canonical = match &namespace {
            Namespace::Cascading => {
                if segments.is_empty() {
                    "/".to_string()
                } else {
                    format!(
                        "/{}",
                        segments
                            .iter()
                            .map(|s| escape_part(s))
                            .collect::<Vec<_>>()
                            .join("/")
                    )
                }
            }
            Namespace::Meta => segments
                .iter()
                .map(|s| escape_part(s))
                .collect::<Vec<_>>()
                .join("/"),
            Namespace::User(owner) => {
                let prefix = match owner {
                    Some(o) => format!("user:{}", o),
                    None => "user".to_string(),
                };
                join_rooted(&prefix, &segments)
            }
            _ => join_rooted(namespace.keyword(), &segments),
        };

        let mut unescaped = Vec::new();
        unescaped.extend_from_slice(namespace.token());
        unescaped.push(0);
        for seg in &segments {
            unescaped.extend_from_slice(seg.as_bytes());
            unescaped.push(0);
        }

        Name {
            canonical,
            unescaped: UnescapedNameBuf(unescaped),
            namespace,
        }
    }

    /// The raw (unescaped) path segments, namespace token excluded.
    fn raw_segments(&self) -> Vec<String> {
        self.unescaped
            .as_unescaped_name()
            .segments()
            .skip(1)
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect()
    }

    /// Appends `suffix` to this name's tail, canonicalising `.`/`..`
    /// relative to the existing segments. The namespace can never change;
    /// `..` is clamped at the root rather than rejected (spec §4.2
    /// `add-name`, open question in §9 resolved in favour of clamping —
    /// see DESIGN.md).
    pub fn add_suffix_clamped(&self, suffix: &str) -> Result<Self> {
        if self.is_empty() {
            return Err(KdbError::InvalidArgument);
        }
        let head = suffix.split('/').next().unwrap_or(suffix);
        let looks_like_namespace_change = suffix.starts_with('/')
            || matches!(
                head.split_once(':').map(|(kw, _)| kw).unwrap_or(head),
                "spec" | "proc" | "dir" | "user" | "system" | "default"
            );
        if looks_like_namespace_change {
            return Err(KdbError::InvalidName(
                "add-name may not change the namespace segment".to_string(),
            ));
        }
        let mut segments = self.raw_segments();
        for escaped in split_escaped(suffix) {
            if escaped == "." {
                continue;
            }
            if escaped == ".." {
                segments.pop();
                continue;
            }
            segments.push(unescape_part(escaped));
        }
        Ok(Name::from_parts(self.namespace.clone(), segments))
    }

    /// Replaces the final segment with `escape_part(raw)`, or appends it if
    /// the name has no segments yet (spec §4.2 `set-base-name`/
    /// `add-base-name`).
    pub fn with_base_name(&self, raw: &str, replace_last: bool) -> Result<Self> {
        if self.is_empty() {
            return Err(KdbError::InvalidArgument);
        }
        let mut segments = self.raw_segments();
        if replace_last {
            if segments.pop().is_none() {
                return Err(KdbError::InvalidArgument);
            }
        }
        segments.push(raw.to_string());
        Ok(Name::from_parts(self.namespace.clone(), segments))
    }

    /// `Validate(name) -> bool` (spec §4.1).
    pub fn validate(name: &str) -> bool {
        Name::parse(name).is_ok()
    }

    /// The canonical escaped name, as the caller would type it.
    pub fn as_canonical_str(&self) -> &str {
        &self.canonical
    }

    /// The raw, NUL-segmented sort key.
    pub fn unescaped(&self) -> UnescapedName<'_> {
        self.unescaped.as_unescaped_name()
    }

    /// The namespace this name belongs to.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.namespace, Namespace::Empty)
    }
}

fn join_rooted(prefix: &str, segments: &[String]) -> String {
    if segments.is_empty() {
        prefix.to_string()
    } else {
        format!(
            "{}/{}",
            prefix,
            segments
                .iter()
                .map(|s| escape_part(s))
                .collect::<Vec<_>>()
                .join("/")
        )
    }
}

fn reject_colon_on_non_user_namespace(input: &str) -> Result<()> {
    let head = input.split('/').next().unwrap_or(input);
    if let Some((kw, _)) = head.split_once(':') {
        if matches!(kw, "spec" | "proc" | "dir" | "system" | "default") {
            return Err(KdbError::InvalidName(format!(
                "namespace '{}' does not take an owner suffix",
                kw
            )));
        }
    }
    Ok(())
}

fn strip_prefix_region<'a>(input: &'a str, prefix: &str) -> Result<&'a str> {
    let rest = &input[prefix.len()..];
    if rest.is_empty() {
        Ok("")
    } else if let Some(stripped) = rest.strip_prefix('/') {
        Ok(stripped)
    } else {
        Err(KdbError::InvalidName(format!(
            "invalid namespace prefix in '{}'",
            input
        )))
    }
}

/// Tokenizes `region`, applies `.`/`..` canonicalisation and returns the
/// final raw segments. A single `..` past the root is tolerated (elided);
/// a second one is rejected, matching the documented asymmetry between
/// `Canonicalise` and `Key::add_name` (see DESIGN.md).
fn canonicalise_segments(full_input: &str, _namespace: &Namespace, region: &str) -> Result<Vec<String>> {
    let mut segments: Vec<String> = Vec::new();
    let mut root_underflow_used = false;
    for escaped in split_escaped(region) {
        if escaped == "." {
            continue;
        }
        if escaped == ".." {
            if segments.pop().is_some() {
                continue;
            }
            if root_underflow_used {
                return Err(KdbError::InvalidName(format!(
                    "cannot ascend above the root in '{}'",
                    full_input
                )));
            }
            root_underflow_used = true;
            continue;
        }
        segments.push(unescape_part(escaped));
    }
    Ok(segments)
}

/// An owned, NUL-segmented unescaped name: the sort key (spec §3, §6.2).
#[derive(Clone, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct UnescapedNameBuf(Vec<u8>);

impl UnescapedNameBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_unescaped_name(&self) -> UnescapedName<'_> {
        UnescapedName(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for UnescapedNameBuf {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for UnescapedNameBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_unescaped_name().fmt(f)
    }
}

/// A borrowed unescaped name (spec §3, §6.2).
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct UnescapedName<'a>(&'a [u8]);

impl<'a> UnescapedName<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> Segments<'a> {
        Segments(self.0)
    }

    pub fn to_owned(&self) -> UnescapedNameBuf {
        UnescapedNameBuf(self.0.to_vec())
    }
}

impl<'a> AsRef<[u8]> for UnescapedName<'a> {
    fn as_ref(&self) -> &[u8] {
        self.0
    }
}

impl<'a> std::fmt::Debug for UnescapedName<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let segs: Vec<String> = self
            .segments()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();
        write!(f, "{}", segs.join("/"))
    }
}

/// Iterator over the raw segments of an [`UnescapedName`].
pub struct Segments<'a>(&'a [u8]);

impl<'a> Iterator for Segments<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.0.is_empty() {
            return None;
        }
        let pos = self.0.iter().position(|&b| b == 0)?;
        let (seg, rest) = self.0.split_at(pos);
        self.0 = &rest[1..];
        Some(seg)
    }
}

/// `is-below(a, b)`: true iff `a`'s unescaped name is a strict,
/// segment-aligned prefix of `b`'s (spec §4.1). Segment alignment is
/// automatic here because every unescaped name ends with a NUL
/// terminator: if `a`'s bytes are a strict prefix of `b`'s, that prefix
/// necessarily ends right after a terminator.
pub fn is_below(a: UnescapedName, b: UnescapedName) -> bool {
    let (ab, bb) = (a.as_bytes(), b.as_bytes());
    ab.len() < bb.len() && bb.starts_with(ab)
}

/// `a` is below `b`, or equal to it.
pub fn is_below_or_same(a: UnescapedName, b: UnescapedName) -> bool {
    a == b || is_below(a, b)
}

/// `is-directly-below(a, b)`: `a` is below `b` with exactly one
/// additional segment (spec §4.1).
pub fn is_directly_below(a: UnescapedName, b: UnescapedName) -> bool {
    if !is_below(a, b) {
        return false;
    }
    let suffix = &b.as_bytes()[a.as_bytes().len()..];
    suffix.iter().filter(|&&byte| byte == 0).count() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(s: &str) -> String {
        Name::parse(s).unwrap().as_canonical_str().to_string()
    }

    #[test]
    fn empty_name() {
        let n = Name::empty();
        assert!(n.is_empty());
        assert_eq!(n.unescaped().as_bytes().len(), 0);
        assert_eq!(n.as_canonical_str().len(), 1);
    }

    #[test]
    fn cascading_root_is_its_own_canonical_form() {
        assert_eq!(canon("/"), "/");
    }

    #[test]
    fn collapses_double_slash() {
        assert_eq!(canon("/a//b"), "/a/b");
    }

    #[test]
    fn collapses_dot() {
        assert_eq!(canon("/a/./b"), "/a/b");
    }

    #[test]
    fn collapses_dotdot() {
        assert_eq!(canon("/a/../b"), "/b");
    }

    #[test]
    fn dotdot_at_cascading_root_is_elided() {
        assert_eq!(canon("/../a"), "/a");
    }

    #[test]
    fn rooted_trailing_dotdot_collapses_to_bare_namespace() {
        assert_eq!(canon("system/.."), "system");
    }

    #[test]
    fn double_underflow_is_invalid() {
        assert!(Name::parse("system/../..").is_err());
    }

    #[test]
    fn messy_relative_segments_canonicalise() {
        assert_eq!(canon("user///sw/../sw//././MyApp"), "user/sw/MyApp");
    }

    #[test]
    fn escape_roundtrip_is_idempotent() {
        for raw in ["a", "", ".", "..", "%foo", "a/b", "a\\b", "my.key"] {
            let escaped = escape_part(raw);
            assert_eq!(unescape_part(&escaped), raw);
        }
    }

    #[test]
    fn canonicalise_is_idempotent() {
        for n in ["user/sw/app", "/a/b/c", "system", "owner/comment", ""] {
            let once = canon(n);
            let twice = canon(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn classify_namespaces() {
        assert_eq!(classify("/a"), Namespace::Cascading);
        assert_eq!(classify("user/a"), Namespace::User(None));
        assert_eq!(classify("user:alice/a"), Namespace::User(Some("alice".into())));
        assert_eq!(classify("system/a"), Namespace::System);
        assert_eq!(classify("owner"), Namespace::Meta);
        assert_eq!(classify("check/validation"), Namespace::Meta);
    }

    #[test]
    fn containment() {
        let user = Name::parse("user").unwrap();
        let tests = Name::parse("user/tests").unwrap();
        let nested = Name::parse("user/tests/a").unwrap();
        let other = Name::parse("user/other").unwrap();
        assert!(is_below(user.unescaped(), tests.unescaped()));
        assert!(is_below(tests.unescaped(), nested.unescaped()));
        assert!(is_directly_below(tests.unescaped(), nested.unescaped()));
        assert!(!is_directly_below(user.unescaped(), nested.unescaped()));
        assert!(!is_below(other.unescaped(), tests.unescaped()));
        assert!(is_below_or_same(tests.unescaped(), tests.unescaped()));
    }

    #[test]
    fn unescaped_sort_matches_hierarchy() {
        let mut names: Vec<Name> = ["system/b", "system/a", "user/a"]
            .iter()
            .map(|s| Name::parse(s).unwrap())
            .collect();
        names.sort_by(|a, b| a.unescaped().as_bytes().cmp(b.unescaped().as_bytes()));
        let ordered: Vec<_> = names.iter().map(|n| n.as_canonical_str()).collect();
        assert_eq!(ordered, vec!["system/a", "system/b", "user/a"]);
    }

    use proptest::prelude::*;

    fn arb_segment() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9._%]{0,6}"
    }

    fn arb_name() -> impl Strategy<Value = String> {
        (
            prop_oneof![
                Just("user"),
                Just("system"),
                Just("spec"),
                Just("proc"),
                Just("dir"),
                Just("default"),
            ],
            prop::collection::vec(arb_segment(), 0..4),
        )
            .prop_map(|(ns, segs)| {
                if segs.is_empty() {
                    ns.to_string()
                } else {
                    format!("{}/{}", ns, segs.join("/"))
                }
            })
    }

    proptest! {
        #[test]
        fn p1_canonicalisation_is_idempotent(raw in arb_name()) {
            if let Ok(once) = Name::parse(&raw) {
                let twice = Name::parse(once.as_canonical_str()).unwrap();
                prop_assert_eq!(once.as_canonical_str(), twice.as_canonical_str());
            }
        }

        #[test]
        fn p2_escape_unescape_roundtrip(raw in arb_segment()) {
            let escaped = escape_part(&raw);
            prop_assert_eq!(unescape_part(&escaped), raw);
        }

        #[test]
        fn p4_containment_matches_byte_prefix(raw in arb_name()) {
            if let Ok(name) = Name::parse(&raw) {
                let mut segs = name.raw_segments();
                if let Some(last) = segs.pop() {
                    let parent = Name::from_parts(name.namespace().clone(), segs);
                    prop_assert!(is_below(parent.unescaped(), name.unescaped()));
                    let _ = last;
                }
            }
        }
    }
}
