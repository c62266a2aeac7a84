//! 12-character identifiers with a one-letter type prefix.
//!
//! The alphabet excludes 0, O, I and l to avoid ambiguity when ids show up
//! in logs or URLs.

use rand::Rng;

const ID_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
pub const ID_LENGTH: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPrefix {
    Project,
    Map,
    Layer,
    Style,
    PostgresConnection,
}

impl IdPrefix {
    pub fn letter(&self) -> char {
        match self {
            IdPrefix::Project => 'P',
            IdPrefix::Map => 'M',
            IdPrefix::Layer => 'L',
            IdPrefix::Style => 'S',
            IdPrefix::PostgresConnection => 'C',
        }
    }
}

pub fn generate_id(prefix: IdPrefix) -> String {
    let mut rng = rand::rng();
    let mut id = String::with_capacity(ID_LENGTH);
    id.push(prefix.letter());
    for _ in 0..ID_LENGTH - 1 {
        let idx = rng.random_range(0..ID_ALPHABET.len());
        id.push(ID_ALPHABET[idx] as char);
    }
    id
}

/// Whether a string has the shape of a layer id (`L` + 11 alphabet chars).
/// Used by the geoprocessing marshaller to decide which tool arguments are
/// layer references.
pub fn is_layer_id(s: &str) -> bool {
    s.len() == ID_LENGTH
        && s.starts_with('L')
        && s.bytes().skip(1).all(|b| ID_ALPHABET.contains(&b))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_generated_ids_have_prefix_and_length() {
        for (prefix, letter) in [
            (IdPrefix::Project, 'P'),
            (IdPrefix::Map, 'M'),
            (IdPrefix::Layer, 'L'),
            (IdPrefix::Style, 'S'),
            (IdPrefix::PostgresConnection, 'C'),
        ] {
            let id = generate_id(prefix);
            assert_eq!(id.len(), ID_LENGTH);
            assert!(id.starts_with(letter));
        }
    }

    #[test]
    fn test_alphabet_excludes_ambiguous_characters() {
        for _ in 0..256 {
            let id = generate_id(IdPrefix::Layer);
            for c in ['0', 'O', 'I', 'l'] {
                assert!(!id[1..].contains(c), "ambiguous char {c} in {id}");
            }
        }
    }

    #[test]
    fn test_layer_id_shape() {
        assert!(is_layer_id(&generate_id(IdPrefix::Layer)));
        assert!(!is_layer_id(&generate_id(IdPrefix::Map)));
        assert!(!is_layer_id("L123"));
        assert!(!is_layer_id("LOOOOOOOOOOO"));
        assert!(!is_layer_id(""));
        assert!(!is_layer_id("100"));
    }

    proptest! {
        #[test]
        fn proptest_non_layer_strings_rejected(s in "[a-z0-9]{0,24}") {
            // Anything not exactly 12 chars starting with L is rejected.
            if s.len() != ID_LENGTH || !s.starts_with('L') {
                prop_assert!(!is_layer_id(&s));
            }
        }
    }
}
