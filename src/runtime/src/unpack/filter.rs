//! Unpack filters: select which ModelKit entries reach the filesystem.
//!
//! A filter string is `<type1>,<type2>[:<id1>,<id2>]`. Types name entry
//! kinds (`kitfile`, `model`, `datasets`, `code`, `docs`); ids match an
//! entry's name or path. An empty filter list unpacks everything.

use kitops_core::kitfile::{Code, Dataset, Docs, Model, ModelPart};
use kitops_core::oci::BaseType;
use kitops_core::{KitError, Result};

/// One parsed filter: a set of base types and an optional id set.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterConf {
    pub base_types: Vec<BaseType>,
    pub ids: Vec<String>,
}

impl FilterConf {
    fn matches_base_type(&self, base: BaseType) -> bool {
        // Model parts are covered by the 'model' filter
        let base = if base == BaseType::ModelPart {
            BaseType::Model
        } else {
            base
        };
        self.base_types.contains(&base)
    }

    fn matches_id(&self, field: &str) -> bool {
        self.ids.is_empty() || self.ids.iter().any(|id| id == field)
    }

    fn matches(&self, base: BaseType, field: &str) -> bool {
        self.matches_base_type(base) && self.matches_id(field)
    }

    /// Whether this filter selects anything of the model base type.
    pub fn selects_model(&self) -> bool {
        self.matches_base_type(BaseType::Model)
    }
}

/// Parse a filter string into a [`FilterConf`].
pub fn parse_filter(filter: &str) -> Result<FilterConf> {
    let mut parts = filter.splitn(3, ':');
    let types = parts.next().unwrap_or_default();
    let ids = parts.next();
    if parts.next().is_some() {
        return Err(KitError::BadFilter(format!(
            "'{filter}': should be in format <type1>,<type2>[:<id1>,<id2>]"
        )));
    }

    let mut base_types = Vec::new();
    for filter_type in types.split(',') {
        let base = match filter_type {
            "kitfile" => BaseType::Config,
            "model" => BaseType::Model,
            // The media type is singular, the filter plural
            "datasets" => BaseType::Dataset,
            "code" => BaseType::Code,
            "docs" => BaseType::Docs,
            other => {
                return Err(KitError::BadFilter(format!(
                    "invalid filter type '{other}' (must be one of 'kitfile', 'model', 'datasets', 'code', or 'docs')"
                )))
            }
        };
        base_types.push(base);
    }

    let ids = ids
        .map(|s| s.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    Ok(FilterConf { base_types, ids })
}

/// A Kitfile entry viewed through the filter engine.
pub enum FilterTarget<'a> {
    Config,
    Model(&'a Model),
    ModelPart(&'a ModelPart),
    Code(&'a Code),
    Dataset(&'a Dataset),
    Docs(&'a Docs),
}

/// Whether an entry passes the configured filters. Matching is done on
/// name and path; docs and code have no name and match on path only.
pub fn should_unpack(target: &FilterTarget<'_>, filters: &[FilterConf]) -> bool {
    if filters.is_empty() {
        return true;
    }
    match target {
        FilterTarget::Config => filters
            .iter()
            .any(|f| f.base_types.contains(&BaseType::Config)),
        FilterTarget::Model(model) => {
            matches_any(&model.name, BaseType::Model, filters)
                || matches_any(&model.path, BaseType::Model, filters)
        }
        FilterTarget::ModelPart(part) => {
            matches_any(&part.name, BaseType::ModelPart, filters)
                || matches_any(&part.path, BaseType::ModelPart, filters)
        }
        FilterTarget::Code(code) => matches_any(&code.path, BaseType::Code, filters),
        FilterTarget::Dataset(dataset) => {
            matches_any(&dataset.name, BaseType::Dataset, filters)
                || matches_any(&dataset.path, BaseType::Dataset, filters)
        }
        FilterTarget::Docs(docs) => matches_any(&docs.path, BaseType::Docs, filters),
    }
}

fn matches_any(field: &str, base: BaseType, filters: &[FilterConf]) -> bool {
    filters.iter().any(|f| f.matches(base, field))
}

/// Filters for a parent ModelKit: restrict to the model base type while
/// preserving id filters that target model entries. Returns `None` when
/// the child's filters exclude models entirely (nothing to inherit).
pub fn derive_parent_filters(filters: &[FilterConf]) -> Option<Vec<FilterConf>> {
    if filters.is_empty() {
        return Some(vec![FilterConf {
            base_types: vec![BaseType::Model],
            ids: Vec::new(),
        }]);
    }
    let derived: Vec<FilterConf> = filters
        .iter()
        .filter(|f| f.selects_model())
        .map(|f| FilterConf {
            base_types: vec![BaseType::Model],
            ids: f.ids.clone(),
        })
        .collect();
    if derived.is_empty() {
        None
    } else {
        Some(derived)
    }
}
