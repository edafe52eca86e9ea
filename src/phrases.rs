//! Localized phrase lookup over a module's configuration blob.
//!
//! A blob maps phrase ids to per-language strings:
//!
//! ```json
//! {"salut": {"en": "Hi!", "fr": "Salut !"}}
//! ```

use rand::Rng;
use rand::seq::SliceRandom;

/// Resolves phrase ids for one language. Unknown ids resolve to the empty string.
#[derive(Debug, Clone)]
pub struct Phrases {
    blob: serde_json::Value,
    lang: String,
}

impl Phrases {
    pub fn new(blob: serde_json::Value, lang: impl Into<String>) -> Self {
        Self {
            blob,
            lang: lang.into(),
        }
    }

    /// `blob[id][lang]`, or `""` when missing or not a string.
    pub fn get(&self, id: &str) -> &str {
        self.blob
            .get(id)
            .and_then(|entry| entry.get(&self.lang))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
    }

    /// Choose one id uniformly and resolve it.
    pub fn pick<R: Rng + ?Sized>(&self, ids: &[&str], rng: &mut R) -> &str {
        ids.choose(rng).map(|id| self.get(id)).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;

    fn phrases(lang: &str) -> Phrases {
        Phrases::new(
            json!({
                "salut": {"en": "Hi!", "fr": "Salut !"},
                "broken": {"en": 42},
                "only_fr": {"fr": "Coucou"}
            }),
            lang,
        )
    }

    #[test]
    fn resolves_by_language() {
        assert_eq!(phrases("en").get("salut"), "Hi!");
        assert_eq!(phrases("fr").get("salut"), "Salut !");
    }

    #[test]
    fn missing_entries_are_empty() {
        let p = phrases("en");
        assert_eq!(p.get("unknown"), "");
        assert_eq!(p.get("only_fr"), "");
        assert_eq!(p.get("broken"), "");
        assert_eq!(Phrases::new(json!({}), "en").get("salut"), "");
    }

    #[test]
    fn pick_resolves_one_of_the_ids() {
        let p = phrases("fr");
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let s = p.pick(&["salut", "only_fr"], &mut rng);
            assert!(s == "Salut !" || s == "Coucou");
        }
        assert_eq!(p.pick(&[], &mut rng), "");
    }
}
