//! Credential pool: splitting configured key strings and picking one per request.

use rand::seq::IndexedRandom;

use crate::constants::KEY_DISPLAY_LEN;

/// Split a credential string on whitespace, commas and newlines, dropping empty tokens.
pub fn split_keys(credentials: &str) -> Vec<String> {
    credentials
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

/// Pick a key uniformly at random. Returns `None` for an empty pool.
pub fn pick_random(keys: &[String]) -> Option<&str> {
    keys.choose(&mut rand::rng()).map(String::as_str)
}

/// Short key prefix for logs and tables
pub fn key_prefix(key: &str) -> String {
    key.chars().take(KEY_DISPLAY_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_keys_mixed_delimiters() {
        let keys = split_keys(" sk-a,sk-b\nsk-c  sk-d,,\n\n");
        assert_eq!(keys, vec!["sk-a", "sk-b", "sk-c", "sk-d"]);
    }

    #[test]
    fn test_split_keys_empty() {
        assert!(split_keys("").is_empty());
        assert!(split_keys(" ,\n, ").is_empty());
    }

    #[test]
    fn test_pick_random_returns_member() {
        let keys = split_keys("sk-1,sk-2,sk-3");
        for _ in 0..100 {
            let picked = pick_random(&keys).unwrap();
            assert!(keys.iter().any(|k| k == picked));
        }
    }

    #[test]
    fn test_pick_random_empty_is_none() {
        assert_eq!(pick_random(&[]), None);
    }

    #[test]
    fn test_key_prefix() {
        assert_eq!(key_prefix("sk-1234567890"), "sk-12345");
        assert_eq!(key_prefix("short"), "short");
    }
}
