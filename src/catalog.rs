//! Case catalog
//!
//! An immutable registry of [`CaseDescriptor`]s built once at startup by the
//! table-driven builders in [`crate::cases`]. Besides lookup by id it keeps
//! insertion order, which is what numeric `/runCase?case=N` selection and
//! reports use.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::case_id::CaseId;
use crate::error::{ConfigurationError, Result};
use crate::script::Script;

/// One registered conformance case
#[derive(Debug, Clone, PartialEq)]
pub struct CaseDescriptor {
    pub id: CaseId,
    pub description: String,
    pub expectation: String,
    pub script: Script,
}

impl CaseDescriptor {
    /// Description up to the first markup tag, whitespace coalesced
    pub fn pretty_description(&self) -> String {
        let head = self.description.split('<').next().unwrap_or_default();
        head.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Registry of cases with category titles
#[derive(Debug, Default)]
pub struct CaseCatalog {
    cases: Vec<Arc<CaseDescriptor>>,
    by_id: HashMap<CaseId, usize>,
    titles: BTreeMap<CaseId, String>,
}

impl CaseCatalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// The complete RFC 6455 case set
    pub fn standard() -> Result<Self> {
        let mut builder = Self::builder();
        crate::cases::register_all(&mut builder);
        builder.build()
    }

    /// The WAMPv1 case set
    pub fn wamp() -> Result<Self> {
        let mut builder = Self::builder();
        crate::cases::register_wamp(&mut builder);
        builder.build()
    }

    /// Catalog for a spec's `caseset` name
    pub fn for_case_set(name: &str) -> Result<Self> {
        match name {
            crate::spec::CASE_SET => Self::standard(),
            crate::spec::WAMP_CASE_SET => Self::wamp(),
            other => Err(ConfigurationError::UnsupportedCaseSet(other.to_string()).into()),
        }
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn get(&self, id: &CaseId) -> Option<&Arc<CaseDescriptor>> {
        self.by_id.get(id).map(|&i| &self.cases[i])
    }

    pub fn contains(&self, id: &CaseId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Case at 1-based insertion `index`
    pub fn by_index(&self, index: usize) -> Option<&Arc<CaseDescriptor>> {
        index.checked_sub(1).and_then(|i| self.cases.get(i))
    }

    /// 1-based insertion index of `id`
    pub fn index_of(&self, id: &CaseId) -> Option<usize> {
        self.by_id.get(id).map(|i| i + 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CaseDescriptor>> {
        self.cases.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &CaseId> {
        self.cases.iter().map(|c| &c.id)
    }

    /// Title of a category (`[9]`) or sub-category (`[9, 1]`)
    pub fn title(&self, prefix: &CaseId) -> Option<&str> {
        self.titles.get(prefix).map(String::as_str)
    }

    /// Category and sub-category titles in numeric order
    pub fn titles(&self) -> impl Iterator<Item = (&CaseId, &str)> {
        self.titles.iter().map(|(k, v)| (k, v.as_str()))
    }
}

/// Accumulates registrations; duplicates surface at [`CatalogBuilder::build`]
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    cases: Vec<CaseDescriptor>,
    titles: BTreeMap<CaseId, String>,
}

impl CatalogBuilder {
    /// Name a category or sub-category
    pub fn title(&mut self, prefix: &[u32], title: impl Into<String>) -> &mut Self {
        self.titles.insert(CaseId::from(prefix), title.into());
        self
    }

    pub fn case(
        &mut self,
        id: &[u32],
        description: impl Into<String>,
        expectation: impl Into<String>,
        script: impl Into<Script>,
    ) -> &mut Self {
        self.cases.push(CaseDescriptor {
            id: CaseId::from(id),
            description: description.into(),
            expectation: expectation.into(),
            script: script.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn build(self) -> Result<CaseCatalog> {
        let mut by_id = HashMap::with_capacity(self.cases.len());
        let mut errors = Vec::new();
        for (i, case) in self.cases.iter().enumerate() {
            if by_id.insert(case.id.clone(), i).is_some() {
                errors.push(ConfigurationError::InvalidValue {
                    field: "case id".into(),
                    reason: format!("case {} registered twice", case.id),
                });
            }
        }
        crate::error::ConfigurationErrors::check(errors)?;
        Ok(CaseCatalog {
            cases: self.cases.into_iter().map(Arc::new).collect(),
            by_id,
            titles: self.titles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::ExpectedClose;
    use crate::script::FrameSequence;

    fn noop() -> Script {
        Script::Sequence(FrameSequence::new(vec![], vec![], ExpectedClose::normal()))
    }

    #[test]
    fn test_builder_indexes() {
        let mut b = CaseCatalog::builder();
        b.title(&[1], "Framing")
            .case(&[1, 1, 1], "first", "x", noop())
            .case(&[1, 1, 2], "second <b>bold</b>", "x", noop());
        let catalog = b.build().unwrap();
        assert_eq!(catalog.len(), 2);

        let id = CaseId::new([1, 1, 2]);
        assert_eq!(catalog.index_of(&id), Some(2));
        assert_eq!(catalog.by_index(2).unwrap().id, id);
        assert!(catalog.by_index(0).is_none());
        assert!(catalog.by_index(3).is_none());
        assert_eq!(catalog.get(&id).unwrap().pretty_description(), "second");
        assert_eq!(catalog.title(&CaseId::new([1])), Some("Framing"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut b = CaseCatalog::builder();
        b.case(&[1, 1], "a", "x", noop()).case(&[1, 1], "b", "x", noop());
        assert!(b.build().is_err());
    }

    #[test]
    fn test_standard_catalog_is_well_formed() {
        let catalog = CaseCatalog::standard().unwrap();
        assert!(catalog.len() > 400);
        for case in catalog.iter() {
            assert!(!case.description.is_empty(), "{}", case.id);
            assert!(!case.expectation.is_empty(), "{}", case.id);
            let category = CaseId::new([case.id.category()]);
            assert!(catalog.title(&category).is_some(), "no title for {}", case.id);
        }
        assert!(catalog.contains(&"6.1.2".parse().unwrap()));
        assert!(!catalog.contains(&"2.2.1.1".parse().unwrap()));
        assert!(catalog.contains(&"9.1.2".parse().unwrap()));
        assert!(catalog.contains(&"13.7.18".parse().unwrap()));
    }

    #[test]
    fn test_case_set_by_name() {
        let wamp = CaseCatalog::for_case_set("wamp").unwrap();
        assert!(wamp.contains(&"2.2.3.1".parse().unwrap()));
        assert!(!wamp.contains(&"1.1.1".parse().unwrap()));
        assert_eq!(
            CaseCatalog::for_case_set("websocket").unwrap().len(),
            CaseCatalog::standard().unwrap().len()
        );
        assert!(matches!(
            CaseCatalog::for_case_set("wsperf"),
            Err(crate::error::Error::Configuration(_))
        ));
    }
}
