use crate::LabelSelector;
use std::{collections::BTreeMap, sync::Arc};

#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

/// Selects resources by exact label equality.
///
/// An empty selector matches every resource.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct Selector(Map);

/// A selector uses a form that cannot be expressed as a conjunction of label equalities.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unsupported label selector: {0}")]
pub struct UnsupportedSelector(String);

// === Selector ===

impl Selector {
    pub fn from_map(map: Map) -> Self {
        Self(map)
    }

    /// Converts a selector, treating an absent selector as empty.
    pub fn from_optional(selector: Option<&LabelSelector>) -> Result<Self, UnsupportedSelector> {
        selector.map_or_else(|| Ok(Self::default()), Self::try_from)
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.0
            .iter()
            .all(|(k, v)| labels.0.get(k).is_some_and(|l| l == v))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn as_map(&self) -> &Map {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl TryFrom<&LabelSelector> for Selector {
    type Error = UnsupportedSelector;

    fn try_from(selector: &LabelSelector) -> Result<Self, Self::Error> {
        if let Some(expr) = selector.match_expressions.iter().flatten().next() {
            return Err(UnsupportedSelector(format!(
                "matchExpressions are not supported (key {} {})",
                expr.key, expr.operator
            )));
        }
        Ok(Self(selector.match_labels.clone().unwrap_or_default()))
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

// === Labels ===

impl Labels {
    /// Iterates over the labels that differ between `self` and `other`.
    ///
    /// Yields `(key, old, new)` for every key whose value was added, changed or removed.
    pub fn diff<'a>(
        &'a self,
        other: &'a Labels,
    ) -> impl Iterator<Item = (&'a str, Option<&'a str>, Option<&'a str>)> + 'a {
        let removed = self
            .0
            .iter()
            .filter(|(k, _)| !other.0.contains_key(*k))
            .map(|(k, v)| (k.as_str(), Some(v.as_str()), None));
        let changed = other.0.iter().filter_map(|(k, v)| {
            let old = self.0.get(k);
            (old != Some(v)).then(|| (k.as_str(), old.map(String::as_str), Some(v.as_str())))
        });
        removed.chain(changed)
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LabelSelectorRequirement;
    use maplit::btreemap;

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Labels::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "bar"))),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                Labels::from_iter(Some(("foo", "bar"))),
                false,
                "insufficient label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "baz"))),
                false,
                "mismatched value",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn rejects_expressions() {
        let selector = LabelSelector {
            match_labels: Some(btreemap! { "app".to_string() => "web".to_string() }),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["frontend".to_string()]),
            }]),
        };
        assert!(Selector::try_from(&selector).is_err());

        let selector = LabelSelector {
            match_labels: Some(btreemap! { "app".to_string() => "web".to_string() }),
            match_expressions: Some(vec![]),
        };
        assert_eq!(
            Selector::try_from(&selector).unwrap(),
            Selector::from_iter(Some(("app", "web")))
        );
        assert!(Selector::from_optional(None).unwrap().is_empty());
    }

    #[test]
    fn diff() {
        let old = Labels::from_iter(vec![("a", "1"), ("b", "2"), ("c", "3")]);
        let new = Labels::from_iter(vec![("a", "1"), ("b", "20"), ("d", "4")]);
        let mut changes = old.diff(&new).collect::<Vec<_>>();
        changes.sort();
        assert_eq!(
            changes,
            vec![
                ("b", Some("2"), Some("20")),
                ("c", Some("3"), None),
                ("d", None, Some("4")),
            ]
        );
        assert_eq!(new.diff(&new).count(), 0);
    }
}
