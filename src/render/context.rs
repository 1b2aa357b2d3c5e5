//! Data access during a rendering: collection planning, item cursors,
//! variable scopes and the up-front missing-data check.

use super::sink::OutValue;
use crate::analyzer::markers::parse_text;
use crate::blueprint::{CollectionSizes, Requirements, TextPart};
use crate::config::MissingDataPolicy;
use crate::data::{DataSource, ItemIter, navigate, resolve_path};
use crate::error::{Result, TemplateError};
use crate::xml::escape_value_text;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything the data source failed to provide.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingData {
    pub variables: Vec<String>,
    pub collections: Vec<String>,
    pub images: Vec<String>,
}

impl MissingData {
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() && self.collections.is_empty() && self.images.is_empty()
    }

    fn into_error(self) -> TemplateError {
        let mut variables = self.variables;
        variables.extend(self.images.into_iter().map(|name| format!("image.{name}")));
        TemplateError::MissingTemplateData {
            variables,
            collections: self.collections,
        }
    }
}

/// Compare the template's requirements against the data source and apply the
/// configured policy.
pub fn check_requirements(
    requirements: &Requirements,
    data: &dyn DataSource,
    policy: MissingDataPolicy,
) -> Result<MissingData> {
    let missing = MissingData {
        variables: requirements
            .variables
            .iter()
            .filter(|path| resolve_path(data, path).is_none())
            .cloned()
            .collect(),
        collections: requirements
            .collections
            .iter()
            .filter(|name| data.items(name).is_none())
            .cloned()
            .collect(),
        images: requirements
            .images
            .iter()
            .filter(|name| data.image(name).is_none())
            .cloned()
            .collect(),
    };
    if missing.is_empty() {
        return Ok(missing);
    }
    match policy {
        MissingDataPolicy::Throw => Err(missing.into_error()),
        MissingDataPolicy::Warn => {
            for name in &missing.variables {
                warn!(variable = %name, "template variable missing from data; rendered blank");
            }
            for name in &missing.collections {
                warn!(collection = %name, "collection missing from data; rendered empty");
            }
            for name in &missing.images {
                warn!(image = %name, "image missing from data; marker left blank");
            }
            Ok(missing)
        }
    }
}

/// Planned collection sizes plus the collections that were materialised.
pub struct Collections<'d> {
    data: &'d dyn DataSource,
    sizes: CollectionSizes,
    materialized: HashMap<String, Arc<Vec<Value>>>,
}

impl<'d> Collections<'d> {
    /// Plan sizes for `names`. Collections in `materialize` are read into
    /// memory (their size is then exact); the rest use the source's size hint
    /// or a counting pass.
    pub fn plan(
        data: &'d dyn DataSource,
        names: &BTreeSet<String>,
        materialize: &BTreeSet<String>,
    ) -> Self {
        let mut sizes = CollectionSizes::new();
        let mut materialized = HashMap::new();
        for name in names {
            if materialize.contains(name) {
                let items: Vec<Value> = data.items(name).map(Iterator::collect).unwrap_or_default();
                sizes.insert(name.clone(), items.len());
                materialized.insert(name.clone(), Arc::new(items));
                continue;
            }
            let count = match data.item_count(name) {
                Some(hint) => hint,
                None => data.items(name).map(Iterator::count).unwrap_or(0),
            };
            debug!(collection = %name, items = count, "planned collection size");
            sizes.insert(name.clone(), count);
        }
        Self {
            data,
            sizes,
            materialized,
        }
    }

    pub fn sizes(&self) -> &CollectionSizes {
        &self.sizes
    }

    pub fn size(&self, name: &str) -> usize {
        self.sizes.get(name).copied().unwrap_or(0)
    }

    pub fn materialized(&self, name: &str) -> Option<&Arc<Vec<Value>>> {
        self.materialized.get(name)
    }

    /// Fresh cursor over a collection's items.
    pub fn cursor(&self, name: &str) -> ItemCursor<'d> {
        match self.materialized.get(name) {
            Some(items) => ItemCursor::Materialized(Arc::clone(items)),
            None => ItemCursor::Streamed {
                iter: self.data.items(name),
                current: None,
                yielded: 0,
            },
        }
    }
}

/// Forward-only access to the items of one collection.
pub enum ItemCursor<'d> {
    Materialized(Arc<Vec<Value>>),
    Streamed {
        iter: Option<ItemIter<'d>>,
        current: Option<Value>,
        yielded: usize,
    },
}

impl ItemCursor<'_> {
    /// Item `index`. Indexes must be requested in ascending order; `None`
    /// means the collection ended before it.
    pub fn item(&mut self, index: usize) -> Option<&Value> {
        match self {
            ItemCursor::Materialized(items) => items.get(index),
            ItemCursor::Streamed {
                iter,
                current,
                yielded,
            } => {
                while *yielded <= index {
                    *current = iter.as_mut().and_then(Iterator::next);
                    if current.is_none() {
                        return None;
                    }
                    *yielded += 1;
                }
                current.as_ref()
            }
        }
    }

    /// Items the collection holds beyond the first `planned`.
    pub fn surplus(&mut self, planned: usize) -> usize {
        match self {
            ItemCursor::Materialized(items) => items.len().saturating_sub(planned),
            ItemCursor::Streamed { iter, yielded, .. } => {
                if *yielded < planned {
                    return 0;
                }
                let extra = iter.as_mut().map(|it| it.count()).unwrap_or(0);
                *yielded += extra;
                extra
            }
        }
    }

    /// Items handed out so far (streamed) or the full length (materialised).
    pub fn seen(&self) -> usize {
        match self {
            ItemCursor::Materialized(items) => items.len(),
            ItemCursor::Streamed { yielded, .. } => *yielded,
        }
    }
}

/// Top-level variable values resolved once per rendering.
pub struct Globals<'d> {
    data: &'d dyn DataSource,
    values: HashMap<String, Value>,
    sizes: CollectionSizes,
}

impl<'d> Globals<'d> {
    pub fn resolve(data: &'d dyn DataSource, requirements: &Requirements, sizes: &CollectionSizes) -> Self {
        let values = requirements
            .variables
            .iter()
            .filter_map(|path| resolve_path(data, path).map(|v| (path.clone(), v)))
            .collect();
        Self {
            data,
            values,
            sizes: sizes.clone(),
        }
    }

    pub fn scope(&self) -> Scope<'_> {
        Scope {
            globals: self,
            item: None,
        }
    }
}

/// Variable lookup for one cell: the current item (under its alias) first,
/// then top-level data.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    globals: &'a Globals<'a>,
    item: Option<(&'a str, &'a Value)>,
}

impl<'a> Scope<'a> {
    pub fn with_item(self, alias: &'a str, item: &'a Value) -> Scope<'a> {
        Scope {
            globals: self.globals,
            item: Some((alias, item)),
        }
    }

    pub fn lookup(&self, path: &str) -> Option<Cow<'a, Value>> {
        if let Some((alias, item)) = self.item {
            if path == alias {
                return Some(Cow::Borrowed(item));
            }
            if let Some(rest) = path.strip_prefix(alias).and_then(|r| r.strip_prefix('.')) {
                return navigate(item, rest).map(Cow::Borrowed);
            }
        }
        if let Some(value) = self.globals.values.get(path) {
            return Some(Cow::Borrowed(value));
        }
        resolve_path(self.globals.data, path).map(Cow::Owned)
    }

    pub fn size_of(&self, collection: &str) -> usize {
        self.globals.sizes.get(collection).copied().unwrap_or(0)
    }

    /// Text of a mixed literal/marker cell.
    pub fn render_parts(&self, parts: &[TextPart]) -> String {
        let mut out = String::new();
        for part in parts {
            match part {
                TextPart::Literal(text) => out.push_str(text),
                TextPart::Variable(path) => {
                    if let Some(value) = self.lookup(path) {
                        out.push_str(&value_text(&value));
                    }
                }
                TextPart::Size(collection) => out.push_str(&self.size_of(collection).to_string()),
            }
        }
        out
    }

    /// Substitute variable markers inside raw XML text (drawings, charts,
    /// headers). Values are escaped; structural and size markers are removed.
    pub fn substitute_xml(&self, xml: &str) -> Result<String> {
        let parsed = parse_text(xml).map_err(|e| TemplateError::template(e.to_string()))?;
        let mut out = String::with_capacity(xml.len());
        for part in &parsed.parts {
            match part {
                TextPart::Literal(text) => out.push_str(text),
                TextPart::Variable(path) => {
                    if let Some(value) = self.lookup(path) {
                        out.push_str(&escape_value_text(&value_text(&value)));
                    }
                }
                TextPart::Size(_) => {}
            }
        }
        Ok(out)
    }
}

/// Display text of a data value.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Cell value for a variable that fills a whole cell.
pub fn value_cell(value: Option<&Value>) -> OutValue {
    match value {
        None | Some(Value::Null) => OutValue::Blank,
        Some(Value::Bool(b)) => OutValue::Bool(*b),
        Some(Value::Number(n)) => OutValue::Number(n.to_string()),
        Some(Value::String(s)) => OutValue::Text(s.clone()),
        Some(other) => OutValue::Text(other.to_string()),
    }
}

/// Whether a numeric value has no fractional part.
pub fn is_integral(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MapDataSource;
    use serde_json::json;

    fn requirements(variables: &[&str], collections: &[&str], images: &[&str]) -> Requirements {
        Requirements {
            variables: variables.iter().map(|s| s.to_string()).collect(),
            collections: collections.iter().map(|s| s.to_string()).collect(),
            images: images.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn missing_data_is_reported_under_throw() {
        let data = MapDataSource::new().with_value("title", "Report");
        let req = requirements(&["title", "author"], &["rows"], &["logo"]);
        let err = check_requirements(&req, &data, MissingDataPolicy::Throw).unwrap_err();
        match err {
            TemplateError::MissingTemplateData {
                variables,
                collections,
            } => {
                assert_eq!(variables, vec!["author".to_string(), "image.logo".to_string()]);
                assert_eq!(collections, vec!["rows".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        let warned = check_requirements(&req, &data, MissingDataPolicy::Warn).unwrap();
        assert_eq!(warned.variables, vec!["author".to_string()]);
    }

    #[test]
    fn scope_prefers_the_item_alias() {
        let data = MapDataSource::new()
            .with_value("company", json!({"name": "Acme"}))
            .with_value("e", "global e");
        let req = requirements(&["company.name"], &[], &[]);
        let globals = Globals::resolve(&data, &req, &CollectionSizes::new());
        let item = json!({"name": "Ann", "salary": 10});
        let scope = globals.scope().with_item("e", &item);
        assert_eq!(scope.lookup("e.name").unwrap().as_ref(), &json!("Ann"));
        assert_eq!(scope.lookup("company.name").unwrap().as_ref(), &json!("Acme"));
        assert!(scope.lookup("e.missing").is_none());
        assert_eq!(globals.scope().lookup("e").unwrap().as_ref(), &json!("global e"));
    }

    #[test]
    fn streamed_cursor_walks_forward_and_counts_surplus() {
        let data = MapDataSource::new()
            .with_collection("rows", vec![json!(1), json!(2), json!(3), json!(4)]);
        let names: BTreeSet<String> = ["rows".to_string()].into();
        let collections = Collections::plan(&data, &names, &BTreeSet::new());
        assert_eq!(collections.size("rows"), 4);
        let mut cursor = collections.cursor("rows");
        assert_eq!(cursor.item(0), Some(&json!(1)));
        assert_eq!(cursor.item(0), Some(&json!(1)));
        assert_eq!(cursor.item(2), Some(&json!(3)));
        assert_eq!(cursor.surplus(2), 1);
        assert_eq!(cursor.seen(), 4);
    }

    #[test]
    fn materialised_collections_are_shared() {
        let data = MapDataSource::new().with_collection("q", vec![json!("a"), json!("b")]);
        let names: BTreeSet<String> = ["q".to_string()].into();
        let collections = Collections::plan(&data, &names, &names);
        assert_eq!(collections.materialized("q").map(|v| v.len()), Some(2));
        let mut cursor = collections.cursor("q");
        assert_eq!(cursor.item(1), Some(&json!("b")));
        assert_eq!(cursor.item(2), None);
    }

    #[test]
    fn xml_substitution_escapes_values() {
        let data = MapDataSource::new().with_value("title", "R&D <Q1>");
        let req = requirements(&["title"], &[], &[]);
        let globals = Globals::resolve(&data, &req, &CollectionSizes::new());
        let out = globals
            .scope()
            .substitute_xml("<a:t>Report: ${title}</a:t>")
            .unwrap();
        assert_eq!(out, "<a:t>Report: R&amp;D &lt;Q1&gt;</a:t>");
    }

    #[test]
    fn values_convert_to_cells() {
        assert_eq!(value_cell(Some(&json!(3))), OutValue::Number("3".into()));
        assert_eq!(value_cell(Some(&json!(null))), OutValue::Blank);
        assert_eq!(value_cell(Some(&json!(true))), OutValue::Bool(true));
        assert!(is_integral(&json!(4.0)));
        assert!(!is_integral(&json!(4.5)));
        assert_eq!(value_text(&json!(false)), "FALSE");
    }
}
