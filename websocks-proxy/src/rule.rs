//! ABP-style rule engine: user-override, whitelist, and GFW list files,
//! plus a process-local learned set of hosts previously routed
//! successfully through the tunnel.
//!
//! Within one file, an `@@` exception always overrides a matching block
//! rule regardless of which line came first — an exception carves an
//! exclusion out of the whole file, it doesn't race the block rules for
//! "first match" (spec.md §8's worked example has the block rule listed
//! before the more specific exception and still expects the exception to
//! win). So block and exception patterns are indexed into entirely
//! separate tries per file, and exceptions are checked first.
//!
//! Two rule shapes exist: a literal-prefix rule ("host begins with"),
//! walked forward over the host bytes, and a suffix rule ("host ends
//! with" or "host equals exactly"), walked over the *reversed* host
//! bytes so both `||domain` (domain-anchor) and `.domain` (dot-suffix)
//! share one trie. Both tries are preindexed so `judge()` stays
//! sub-linear in the number of rules per file instead of scanning every
//! line for every lookup.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::RwLock;

/// `true` means the host needs the tunnel, `false` means it's exempt.
type Verdict = bool;

#[derive(Default)]
struct TrieNode {
    children: HashMap<u8, Box<TrieNode>>,
    /// `Some(exact_only)` if a pattern terminates at this node.
    /// `exact_only` means the hit is honored only when the node was
    /// reached by consuming the *entire* haystack (host == pattern),
    /// not merely a suffix/prefix of it.
    hit: Option<bool>,
}

impl TrieNode {
    fn insert(&mut self, pattern: &[u8], exact_only: bool) {
        let mut node = self;
        for &b in pattern {
            node = node.children.entry(b).or_default();
        }
        // A non-exact insertion subsumes a previously-recorded exact one
        // for the same pattern (e.g. both `||suf` and `.suf` targeting
        // the same bare domain).
        node.hit = match node.hit {
            Some(false) => Some(false),
            _ => Some(exact_only),
        };
    }

    /// Whether any pattern recorded in this trie is a prefix of
    /// `haystack` (an `exact_only` pattern counts only when its length
    /// equals the full haystack length).
    fn has_match(&self, haystack: &[u8]) -> bool {
        let mut node = self;
        let total = haystack.len();
        let hits = |hit: Option<bool>, consumed: usize| matches!(hit, Some(exact_only) if !exact_only || consumed == total);
        if hits(node.hit, 0) {
            return true;
        }
        for (i, &b) in haystack.iter().enumerate() {
            match node.children.get(&b) {
                Some(next) => {
                    node = next;
                    if hits(node.hit, i + 1) {
                        return true;
                    }
                }
                None => return false,
            }
        }
        false
    }
}

/// One parsed rule file, split by polarity: block patterns (plain
/// rules) and exempt patterns (`@@` exceptions), each further split
/// into a literal-prefix forward trie and a domain/dot-suffix reversed
/// trie.
#[derive(Default)]
struct RuleFile {
    block_prefixes: TrieNode,
    block_suffixes: TrieNode,
    exempt_prefixes: TrieNode,
    exempt_suffixes: TrieNode,
}

impl RuleFile {
    fn parse(text: &str) -> Self {
        let mut file = RuleFile::default();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('!') {
                continue;
            }
            let (body, negate) = match line.strip_prefix("@@") {
                Some(rest) => (rest, true),
                None => (line, false),
            };
            if body.is_empty() {
                continue;
            }
            let (prefixes, suffixes) = if negate {
                (&mut file.exempt_prefixes, &mut file.exempt_suffixes)
            } else {
                (&mut file.block_prefixes, &mut file.block_suffixes)
            };

            if let Some(suf) = body.strip_prefix("||") {
                // Domain-anchor: host equals `suf` exactly, or ends in
                // `.suf`. The bare-equality form is the narrower (exact)
                // pattern; the dotted form is a genuine suffix and never
                // requires exact length.
                if !suf.is_empty() {
                    let reversed_bare: Vec<u8> = suf.bytes().rev().collect();
                    suffixes.insert(&reversed_bare, true);
                    let dotted = format!(".{suf}");
                    let reversed_dotted: Vec<u8> = dotted.bytes().rev().collect();
                    suffixes.insert(&reversed_dotted, false);
                }
            } else if let Some(bare) = body.strip_prefix('.') {
                // Dot-suffix: host ends in the full ".suf" (the pattern
                // already carries its own dot boundary), or host equals
                // the bare "suf" with no leading dot at all.
                let reversed_dotted: Vec<u8> = body.bytes().rev().collect();
                suffixes.insert(&reversed_dotted, false);
                if !bare.is_empty() {
                    let reversed_bare: Vec<u8> = bare.bytes().rev().collect();
                    suffixes.insert(&reversed_bare, true);
                }
            } else {
                prefixes.insert(body.as_bytes(), false);
            }
        }
        file
    }

    fn judge(&self, host: &str) -> Option<Verdict> {
        let reversed: Vec<u8> = host.bytes().rev().collect();
        if self.exempt_prefixes.has_match(host.as_bytes()) || self.exempt_suffixes.has_match(&reversed) {
            return Some(false);
        }
        if self.block_prefixes.has_match(host.as_bytes()) || self.block_suffixes.has_match(&reversed) {
            return Some(true);
        }
        None
    }
}

/// GFW lists are conventionally distributed base64-encoded; detect and
/// decode before line-parsing when the file isn't already plain text.
fn decode_rule_text(bytes: &[u8]) -> String {
    let trimmed: Vec<u8> = bytes
        .iter()
        .copied()
        .skip_while(|b| b.is_ascii_whitespace())
        .collect();
    let looks_plain = trimmed
        .first()
        .map(|&b| b == b'!' || b == b'.' || b == b'|' || b == b'@' || b.is_ascii_alphanumeric())
        .unwrap_or(true);
    if looks_plain {
        if let Ok(s) = String::from_utf8(bytes.to_vec()) {
            return s;
        }
    }
    match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &trimmed) {
        Ok(decoded) => String::from_utf8(decoded).unwrap_or_default(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn load_rule_file(path: &Path) -> anyhow::Result<RuleFile> {
    let bytes = std::fs::read(path)?;
    Ok(RuleFile::parse(&decode_rule_text(&bytes)))
}

/// The full rule engine: user override files, a whitelist, a GFW list,
/// and the learned set of hosts that were previously dispatched through
/// the tunnel successfully (grows only, process-local).
pub struct RuleSet {
    user_override: Vec<RuleFile>,
    whitelist: Option<RuleFile>,
    gfwlist: Option<RuleFile>,
    learned: RwLock<HashSet<String>>,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self {
            user_override: Vec::new(),
            whitelist: None,
            gfwlist: None,
            learned: RwLock::new(HashSet::new()),
        }
    }

    /// Load from spec §6's `rulefiles` config key: an ordered list of
    /// paths, the first entry treated as user-override, the rest
    /// classified by filename (`whitelist`/`gfwlist` substring) and
    /// falling back to user-override otherwise.
    pub fn load(paths: &[impl AsRef<Path>]) -> anyhow::Result<Self> {
        let mut set = Self::empty();
        for p in paths {
            let path = p.as_ref();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            let file = load_rule_file(path)?;
            if name.contains("whitelist") {
                set.whitelist = Some(file);
            } else if name.contains("gfwlist") || name.contains("gfw") {
                set.gfwlist = Some(file);
            } else {
                set.user_override.push(file);
            }
        }
        Ok(set)
    }

    /// `Some(true)` = send through the tunnel, `Some(false)` = exempt
    /// (always direct), `None` = unmatched in any list.
    pub fn judge(&self, host: &str) -> Option<Verdict> {
        for file in &self.user_override {
            if let Some(v) = file.judge(host) {
                return Some(v);
            }
        }
        if let Some(v) = self.whitelist.as_ref().and_then(|f| f.judge(host)) {
            return Some(v);
        }
        if let Some(v) = self.gfwlist.as_ref().and_then(|f| f.judge(host)) {
            return Some(v);
        }
        None
    }

    pub fn has_learned(&self, host: &str) -> bool {
        self.learned.read().unwrap().contains(host)
    }

    pub fn learn(&self, host: &str) {
        self.learned.write().unwrap().insert(host.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(text: &str) -> RuleFile {
        RuleFile::parse(text)
    }

    #[test]
    fn domain_anchor_matches_exact_and_subdomains_only() {
        let f = file("||example.com\n");
        assert_eq!(f.judge("example.com"), Some(true));
        assert_eq!(f.judge("sub.example.com"), Some(true));
        // Not a subdomain, just a longer unrelated label — must not match.
        assert_eq!(f.judge("example.com.cn"), None);
        assert_eq!(f.judge("notexample.com"), None);
        assert_eq!(f.judge("other.com"), None);
    }

    #[test]
    fn dot_suffix_matches_suffix_and_bare_domain() {
        let f = file(".example.com\n");
        assert_eq!(f.judge("sub.example.com"), Some(true));
        assert_eq!(f.judge("example.com"), Some(true));
        assert_eq!(f.judge("notexample.com"), None);
    }

    #[test]
    fn literal_prefix_matches_begins_with() {
        let f = file("example\n");
        assert_eq!(f.judge("example.com"), Some(true));
        assert_eq!(f.judge("myexample.com"), None);
    }

    #[test]
    fn exception_negates_inner_rule() {
        let f = file("||example.com\n@@||example.com/allowed\n");
        assert_eq!(f.judge("example.com"), Some(true));
        assert_eq!(f.judge("example.com/allowed"), Some(false));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let f = file("! a comment\n\n||example.com\n");
        assert_eq!(f.judge("example.com"), Some(true));
    }

    #[test]
    fn exception_wins_regardless_of_line_order() {
        // Exception appears before the block rule...
        let f = file("@@||example.com\n||example.com\n");
        assert_eq!(f.judge("example.com"), Some(false));
        // ...and the same holds with the block rule listed first, per
        // the worked example in spec.md §8: a less-specific block rule
        // followed by a more-specific exception still yields Direct for
        // any host the exception covers.
        let f2 = file("||example.com\n@@||foo.example.com\n");
        assert_eq!(f2.judge("bar.example.com"), Some(true));
        assert_eq!(f2.judge("foo.example.com"), Some(false));
    }

    #[test]
    fn learned_set_only_grows() {
        let set = RuleSet::empty();
        assert!(!set.has_learned("example.com"));
        set.learn("example.com");
        assert!(set.has_learned("example.com"));
    }
}
