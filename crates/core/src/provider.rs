//! Storage provider registry defaults.

/// Providers seeded into an empty registry on first start.
pub const DEFAULT_PROVIDERS: &[&str] = &[
    "f02620", "f023971", "f022142", "f019551", "f01240", "f01247", "f01278", "f071624",
    "f0135078", "f022352", "f014768", "f022163", "f09848", "f02576", "f02606", "f019041",
    "f010617", "f023467", "f01276", "f02401", "f02387", "f019104", "f099608", "f062353",
    "f07998", "f019362", "f019100", "f014409", "f066596", "f01234", "f058369", "f08399",
    "f021255", "f08403",
];

/// Check that an address has the form of a Filecoin ID address (`f0…` / `t0…`).
pub fn is_id_address(address: &str) -> bool {
    let digits = address
        .strip_prefix("f0")
        .or_else(|| address.strip_prefix("t0"));
    matches!(digits, Some(d) if !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_providers_unique() {
        let unique: HashSet<_> = DEFAULT_PROVIDERS.iter().collect();
        assert_eq!(unique.len(), DEFAULT_PROVIDERS.len());
    }

    #[test]
    fn test_default_providers_are_id_addresses() {
        for address in DEFAULT_PROVIDERS {
            assert!(is_id_address(address), "{address}");
        }
    }

    #[test]
    fn test_is_id_address() {
        assert!(is_id_address("t01000"));
        assert!(!is_id_address("f0"));
        assert!(!is_id_address("f1abc"));
        assert!(!is_id_address("f0x12"));
    }
}
