//! Cache key construction.

use std::fmt::Display;

use url::form_urlencoded::Serializer;

/// Builds a cache key from a base and named parameters.
///
/// Parameters are sorted by name before they are joined, so the same set of
/// parameters yields the same key regardless of the order (or the map type)
/// it was collected in. Names and values are form-urlencoded, so a value
/// containing `&` or `=` cannot pass for another parameter. Without
/// parameters the key is the base itself; the base is used verbatim.
///
/// ```
/// use hearth::cache::generate_cache_key;
///
/// let a = generate_cache_key("recipes", [("page", 2), ("family", 7)]);
/// let b = generate_cache_key("recipes", [("family", 7), ("page", 2)]);
/// assert_eq!(a, b);
/// assert_eq!(a, "recipes:family=7&page=2");
///
/// let smuggled = generate_cache_key("recipes", [("family", "7&page=2")]);
/// assert_eq!(smuggled, "recipes:family=7%26page%3D2");
/// ```
pub fn generate_cache_key<I, K, V>(base: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Display,
{
    let mut pairs: Vec<(String, String)> = params
        .into_iter()
        .map(|(name, value)| (name.as_ref().to_string(), value.to_string()))
        .collect();
    if pairs.is_empty() {
        return base.to_string();
    }
    pairs.sort();

    let mut query = Serializer::new(String::new());
    query.extend_pairs(&pairs);
    format!("{base}:{}", query.finish())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use super::*;

    #[test]
    fn parameter_order_does_not_matter() {
        let forward = generate_cache_key("x", [("b", 1), ("a", 2)]);
        let reverse = generate_cache_key("x", [("a", 2), ("b", 1)]);
        assert_eq!(forward, reverse);
        assert_eq!(forward, "x:a=2&b=1");
    }

    #[test]
    fn map_types_agree() {
        let mut hashed = HashMap::new();
        let mut ordered = BTreeMap::new();
        for (name, value) in [("zeta", "z"), ("alpha", "a"), ("mid", "m")] {
            hashed.insert(name, value);
            ordered.insert(name, value);
        }

        assert_eq!(
            generate_cache_key("family:42:events", &hashed),
            generate_cache_key("family:42:events", &ordered)
        );
    }

    #[test]
    fn empty_params_yield_base() {
        let params: [(&str, u32); 0] = [];
        assert_eq!(generate_cache_key("settings", params), "settings");
    }

    #[test]
    fn separators_inside_values_do_not_collide() {
        let packed = generate_cache_key("recipes", [("family", "1&page=2")]);
        let split = generate_cache_key("recipes", [("family", "1"), ("page", "2")]);
        assert_ne!(packed, split);
        assert_eq!(split, "recipes:family=1&page=2");
    }

    #[test]
    fn separators_inside_names_do_not_collide() {
        assert_ne!(
            generate_cache_key("r", [("a=b", "c")]),
            generate_cache_key("r", [("a", "b=c")])
        );
        assert_ne!(
            generate_cache_key("r", [("q", "100%")]),
            generate_cache_key("r", [("q", "100%25")])
        );
    }

    #[test]
    fn different_values_produce_different_keys() {
        assert_ne!(
            generate_cache_key("r", [("id", 1)]),
            generate_cache_key("r", [("id", 2)])
        );
    }
}
