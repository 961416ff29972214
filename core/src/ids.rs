use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;

/// Pattern every stored identifier must match: a type prefix followed by
/// 12 lowercase base-36 characters.
pub const ID_PATTERN: &str = "^(wf|tk|cp|ws|ag|ss|msg|tmpl|rp)_[0-9a-z]{12}$";

const SUFFIX_LEN: usize = 12;
const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Entity kinds with their identifier prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Workflow,
    Task,
    Checkpoint,
    Workspace,
    Agent,
    Session,
    Message,
    Template,
    Repository,
}

impl IdKind {
    pub fn prefix(self) -> &'static str {
        match self {
            IdKind::Workflow => "wf",
            IdKind::Task => "tk",
            IdKind::Checkpoint => "cp",
            IdKind::Workspace => "ws",
            IdKind::Agent => "ag",
            IdKind::Session => "ss",
            IdKind::Message => "msg",
            IdKind::Template => "tmpl",
            IdKind::Repository => "rp",
        }
    }
}

fn id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ID_PATTERN).expect("ID_PATTERN is a valid regex"))
}

/// Generate a fresh identifier for the given entity kind.
///
/// 36^12 possibilities per prefix make collisions within a single store
/// vanishingly unlikely; inserts still carry a primary-key constraint.
pub fn generate(kind: IdKind) -> String {
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(kind.prefix().len() + 1 + SUFFIX_LEN);
    id.push_str(kind.prefix());
    id.push('_');
    for _ in 0..SUFFIX_LEN {
        id.push(ALPHABET[rng.gen_range(0..ALPHABET.len())] as char);
    }
    id
}

/// Check whether a string is a well-formed identifier of any kind
pub fn is_valid(id: &str) -> bool {
    id_regex().is_match(id)
}

/// Check whether a string is a well-formed identifier of a specific kind
pub fn is_valid_kind(id: &str, kind: IdKind) -> bool {
    is_valid(id) && id.starts_with(kind.prefix()) && id.as_bytes()[kind.prefix().len()] == b'_'
}

/// Determine the entity kind of an identifier, if well-formed
pub fn kind_of(id: &str) -> Option<IdKind> {
    if !is_valid(id) {
        return None;
    }
    let prefix = id.split('_').next()?;
    match prefix {
        "wf" => Some(IdKind::Workflow),
        "tk" => Some(IdKind::Task),
        "cp" => Some(IdKind::Checkpoint),
        "ws" => Some(IdKind::Workspace),
        "ag" => Some(IdKind::Agent),
        "ss" => Some(IdKind::Session),
        "msg" => Some(IdKind::Message),
        "tmpl" => Some(IdKind::Template),
        "rp" => Some(IdKind::Repository),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_valid() {
        for kind in [
            IdKind::Workflow,
            IdKind::Task,
            IdKind::Checkpoint,
            IdKind::Workspace,
            IdKind::Agent,
            IdKind::Session,
            IdKind::Message,
            IdKind::Template,
            IdKind::Repository,
        ] {
            let id = generate(kind);
            assert!(is_valid(&id), "invalid id generated: {id}");
            assert!(is_valid_kind(&id, kind));
            assert_eq!(kind_of(&id), Some(kind));
        }
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| generate(IdKind::Task)).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_rejects_malformed_ids() {
        assert!(!is_valid(""));
        assert!(!is_valid("wf_"));
        assert!(!is_valid("wf_SHOUTING0000"));
        assert!(!is_valid("wf_0123456789")); // too short
        assert!(!is_valid("wf_0123456789abc")); // too long
        assert!(!is_valid("xx_0123456789ab")); // unknown prefix
        assert!(!is_valid("wf-0123456789ab")); // wrong separator
    }

    #[test]
    fn test_kind_mismatch() {
        let id = generate(IdKind::Workflow);
        assert!(!is_valid_kind(&id, IdKind::Task));
    }
}
