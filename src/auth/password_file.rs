//! Mosquitto-compatible password file parsing
//!
//! One line per user: `username:$6$<base64 salt>$<base64 sha512(password||salt)>`.
//! Empty lines are skipped; lines that fail to parse are dropped with an
//! error log so one bad entry never takes down the rest of the file.

use ahash::AHashMap;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use tracing::error;

/// Salted SHA-512 credentials for one user.
#[derive(Debug, Clone)]
pub struct PasswordEntry {
    pub salt: Vec<u8>,
    pub digest: Vec<u8>,
}

/// Parse one `username:$6$salt$digest` line.
pub fn parse_line(line: &str) -> Result<(String, PasswordEntry), String> {
    let (username, field) = line
        .split_once(':')
        .ok_or_else(|| "missing ':' separator".to_string())?;

    if username.is_empty() || field.is_empty() {
        return Err("an empty field was found".to_string());
    }
    if field.contains(':') {
        return Err("line contains more than one ':'".to_string());
    }

    let rest = field
        .strip_prefix("$6$")
        .ok_or_else(|| "password field must start with $6$".to_string())?;
    let (salt_b64, digest_b64) = rest
        .split_once('$')
        .ok_or_else(|| "expected salt and digest separated by '$'".to_string())?;

    let salt = BASE64_STANDARD
        .decode(salt_b64)
        .map_err(|e| format!("invalid base64 salt: {e}"))?;
    let digest = BASE64_STANDARD
        .decode(digest_b64)
        .map_err(|e| format!("invalid base64 digest: {e}"))?;

    if salt.is_empty() || digest.is_empty() {
        return Err("an empty field was found".to_string());
    }

    Ok((username.to_string(), PasswordEntry { salt, digest }))
}

/// Parse a whole password file, dropping malformed lines loudly.
pub fn parse_password_file(content: &str) -> AHashMap<String, PasswordEntry> {
    let mut entries = AHashMap::new();

    for line in content.lines() {
        if line.is_empty() {
            continue;
        }

        match parse_line(line) {
            Ok((username, entry)) => {
                entries.insert(username, entry);
            }
            Err(err) => {
                let cut: String = line.chars().take(20).collect();
                error!(
                    line = %format!("{cut}..."),
                    %err,
                    "dropping invalid username/password line"
                );
            }
        }
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    // alice with salt "saltsalt" and password "p"
    fn well_formed_line() -> String {
        use sha2::{Digest, Sha512};
        let mut hasher = Sha512::new();
        hasher.update(b"p");
        hasher.update(b"saltsalt");
        let digest = hasher.finalize();
        format!(
            "alice:$6${}${}",
            BASE64_STANDARD.encode(b"saltsalt"),
            BASE64_STANDARD.encode(digest)
        )
    }

    #[test]
    fn test_parse_well_formed_line() {
        let (username, entry) = parse_line(&well_formed_line()).unwrap();
        assert_eq!(username, "alice");
        assert_eq!(entry.salt, b"saltsalt");
        assert_eq!(entry.digest.len(), 64);
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(parse_line("no-separator").is_err());
        assert!(parse_line(":$6$c2FsdA==$aGFzaA==").is_err());
        assert!(parse_line("user:").is_err());
        assert!(parse_line("user:extra:$6$c2FsdA==$aGFzaA==").is_err());
        assert!(parse_line("user:$5$c2FsdA==$aGFzaA==").is_err());
        assert!(parse_line("user:$6$c2FsdA==").is_err());
        assert!(parse_line("user:$6$!notbase64$aGFzaA==").is_err());
        assert!(parse_line("user:$6$$aGFzaA==").is_err());
    }

    #[test]
    fn test_bad_lines_do_not_drop_good_ones() {
        let content = format!(
            "\n{}\nbroken line without separator\nbob:$6$c2FsdA==$aGFzaA==\n",
            well_formed_line()
        );
        let entries = parse_password_file(&content);
        assert_eq!(entries.len(), 2);
        assert!(entries.contains_key("alice"));
        assert!(entries.contains_key("bob"));
    }

    #[test]
    fn test_duplicate_username_keeps_last() {
        let content = "u:$6$c2FsdA==$Zmlyc3Q=\nu:$6$c2FsdA==$c2Vjb25k";
        let entries = parse_password_file(content);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["u"].digest, b"second");
    }
}
