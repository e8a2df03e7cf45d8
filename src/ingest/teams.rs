use crate::config::TeamsConfig;
use std::collections::HashMap;

/// Suffixes and prefixes that providers attach inconsistently to club names.
const CLUB_AFFIXES: &[&str] = &["fc", "cf", "afc", "sc", "ac"];

fn fold_char(c: char) -> Option<&'static str> {
    Some(match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ą' => "a",
        'æ' => "ae",
        'ç' | 'ć' | 'č' => "c",
        'ď' | 'đ' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => "e",
        'ğ' => "g",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'ı' => "i",
        'ł' => "l",
        'ñ' | 'ń' | 'ň' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'œ' => "oe",
        'ř' => "r",
        'ś' | 'š' | 'ş' | 'ș' => "s",
        'ß' => "ss",
        'ť' | 'ţ' | 'ț' => "t",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => "u",
        'ý' | 'ÿ' => "y",
        'ź' | 'ż' | 'ž' => "z",
        _ => return None,
    })
}

/// Lowercase, strip diacritics, keep only ASCII alphanumerics.
pub fn normalise_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if let Some(folded) = fold_char(c) {
            out.push_str(folded);
        }
    }
    out
}

/// Normalised name with common club affixes ("FC", "AFC"...) removed, as a
/// second chance when the plain normalised form is unknown.
fn without_affixes(name: &str) -> String {
    let words: Vec<String> = name
        .split(|c: char| c.is_whitespace() || c == '.' || c == '-')
        .map(normalise_name)
        .filter(|w| !w.is_empty() && !CLUB_AFFIXES.contains(&w.as_str()))
        .collect();
    words.concat()
}

/// Two-level display-name to `team_key` lookup.
#[derive(Debug, Clone, Default)]
pub struct TeamResolver {
    exact: HashMap<String, String>,
    normalised: HashMap<String, String>,
    allow_unlisted: bool,
}

impl TeamResolver {
    pub fn new(config: &TeamsConfig) -> Self {
        let mut resolver = Self {
            allow_unlisted: config.allow_unlisted,
            ..Self::default()
        };
        for (alias, key) in &config.aliases {
            resolver.exact.insert(alias.clone(), key.clone());
            resolver
                .normalised
                .entry(normalise_name(alias))
                .or_insert_with(|| key.clone());
            resolver
                .normalised
                .entry(without_affixes(alias))
                .or_insert_with(|| key.clone());
            // The key itself is a valid spelling.
            resolver
                .normalised
                .entry(normalise_name(key))
                .or_insert_with(|| key.clone());
        }
        resolver.normalised.remove("");
        resolver
    }

    pub fn resolve(&self, display_name: &str) -> Option<String> {
        let trimmed = display_name.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(key) = self.exact.get(trimmed) {
            return Some(key.clone());
        }
        let normalised = normalise_name(trimmed);
        if normalised.is_empty() {
            return None;
        }
        if let Some(key) = self.normalised.get(&normalised) {
            return Some(key.clone());
        }
        let stripped = without_affixes(trimmed);
        if let Some(key) = self.normalised.get(&stripped) {
            return Some(key.clone());
        }
        if self.allow_unlisted {
            let key = if stripped.is_empty() { normalised } else { stripped };
            return Some(key);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn resolver(allow_unlisted: bool) -> TeamResolver {
        let mut aliases = BTreeMap::new();
        aliases.insert("Man Utd".to_string(), "manchester-united".to_string());
        aliases.insert("Manchester United FC".to_string(), "manchester-united".to_string());
        aliases.insert("Atlético Madrid".to_string(), "atletico-madrid".to_string());
        TeamResolver::new(&TeamsConfig {
            aliases,
            allow_unlisted,
        })
    }

    #[test]
    fn test_normalise_name() {
        assert_eq!(normalise_name("Atlético  Madrid"), "atleticomadrid");
        assert_eq!(normalise_name("Bayern München"), "bayernmunchen");
        assert_eq!(normalise_name("Brighton & Hove Albion"), "brightonhovealbion");
        assert_eq!(normalise_name("Fußball-Club"), "fussballclub");
        assert_eq!(normalise_name("---"), "");
    }

    #[test]
    fn test_exact_then_normalised_lookup() {
        let r = resolver(false);
        assert_eq!(r.resolve("Man Utd").as_deref(), Some("manchester-united"));
        assert_eq!(r.resolve("MAN UTD").as_deref(), Some("manchester-united"));
        assert_eq!(r.resolve("Manchester United").as_deref(), Some("manchester-united"));
        assert_eq!(r.resolve("Atletico Madrid").as_deref(), Some("atletico-madrid"));
        assert_eq!(r.resolve("manchester-united").as_deref(), Some("manchester-united"));
    }

    #[test]
    fn test_unlisted_names() {
        assert_eq!(resolver(false).resolve("Fulham FC"), None);
        assert_eq!(resolver(true).resolve("Fulham FC").as_deref(), Some("fulham"));
        assert_eq!(resolver(true).resolve("Fulham").as_deref(), Some("fulham"));
        assert_eq!(resolver(true).resolve("   "), None);
        assert_eq!(resolver(true).resolve("???"), None);
    }
}
