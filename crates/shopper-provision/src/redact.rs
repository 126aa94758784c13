//! Credential redaction for diagnostic emission (§4.1 Redaction, §6.1).

use std::sync::OnceLock;

fn query_credential_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"(?i)([?&](?:api_key|api_token)=)[^&\s]+").unwrap())
}

fn ssh_key_field_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r#"("ssh_key"\s*:\s*")[^"]*(")"#).unwrap())
}

fn base64_shell_fragment_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"echo '[^']*' \| base64").unwrap())
}

/// Replace query-parameter credentials (`api_key=`/`api_token=`), the
/// `ssh_key` JSON field value, and `echo '…' | base64` shell fragments
/// with `REDACTED` before logging or otherwise surfacing request/response
/// text derived from a provider call.
pub fn redact(text: &str) -> String {
    let text = query_credential_regex().replace_all(text, "${1}REDACTED");
    let text = ssh_key_field_regex().replace_all(&text, "${1}REDACTED${2}");
    base64_shell_fragment_regex().replace_all(&text, "echo 'REDACTED' | base64").into_owned()
}

/// Shell-quote an SSH public key for embedding in a single-quoted shell
/// string: every `'` becomes the four-character sequence `'\''` (§4.1 SSH
/// key installation contract).
pub fn shell_quote_single(value: &str) -> String {
    value.replace('\'', r#"'\''"#)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_query_credential() {
        let text = "GET https://api.example.com/v1/instances?api_key=supersecret123&page=1";
        let out = redact(text);
        assert!(!out.contains("supersecret123"));
        assert!(out.contains("api_key=REDACTED"));
        assert!(out.contains("page=1"));
    }

    #[test]
    fn test_redacts_api_token_case_insensitive() {
        let text = "?API_TOKEN=xyz&other=1";
        let out = redact(text);
        assert!(!out.contains("xyz"));
    }

    #[test]
    fn test_redacts_ssh_key_json_field() {
        let text = r#"{"ssh_key": "ssh-ed25519 AAAAABBBB user@host", "name": "i-1"}"#;
        let out = redact(text);
        assert!(!out.contains("AAAAABBBB"));
        assert!(out.contains(r#""ssh_key": "REDACTED""#));
        assert!(out.contains("i-1"));
    }

    #[test]
    fn test_redacts_base64_shell_fragment() {
        let text = "run: echo 'c2VjcmV0LWRhdGE=' | base64 -d > /tmp/key";
        let out = redact(text);
        assert!(!out.contains("c2VjcmV0LWRhdGE="));
        assert!(out.contains("echo 'REDACTED' | base64"));
    }

    #[test]
    fn test_shell_quote_single() {
        assert_eq!(shell_quote_single("it's fine"), r#"it'\''s fine"#);
        assert_eq!(shell_quote_single("no quotes"), "no quotes");
    }
}
