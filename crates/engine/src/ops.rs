//! Document operations.
//!
//! Everything here runs against the open document. Composite reads follow
//! the create / read-layout / destroy discipline: the session object backing
//! a read is destroyed on every exit path, and a destroy failure after a
//! successful read becomes a [`Fetched::cleanup_warning`] instead of an
//! error.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use qsense_protocol::{
    CatalogKind, Cell, CrossTabData, CrossTabDef, FieldValues, GenericLayout, Handle, ObjectRef,
    ObjectReturn, SessionObjectDef, ValueListDef,
};

use crate::session::EngineSession;
use crate::{EngineError, Fetched};

/// Expression set computed by [`EngineSession::field_statistics`], in column
/// order.
const STAT_LABELS: [&str; 10] = [
    "unique_values",
    "total_count",
    "non_null_count",
    "min_value",
    "max_value",
    "avg_value",
    "sum_value",
    "median_value",
    "mode_value",
    "std_deviation",
];

impl EngineSession {
    // ── Session object lifecycle ────────────────────────────────────

    /// Ask the engine to materialize a session object. The caller owns its
    /// destruction.
    pub fn create_session_object(
        &mut self,
        def: &SessionObjectDef,
    ) -> Result<ObjectRef, EngineError> {
        let handle = self.document_handle_checked()?;
        let reply = self.call("CreateSessionObject", json!([def.properties()]), handle)?;

        let ret: ObjectReturn = reply
            .get("qReturn")
            .cloned()
            .ok_or_else(|| {
                EngineError::Protocol("CreateSessionObject reply carried no qReturn".to_string())
            })
            .and_then(|raw| {
                serde_json::from_value(raw).map_err(|e| EngineError::Protocol(e.to_string()))
            })?;

        if !ret.handle.is_valid() {
            return Err(EngineError::Protocol(
                "CreateSessionObject reply carried no handle".to_string(),
            ));
        }
        Ok(ObjectRef {
            handle: ret.handle,
            id: ret.generic_id.unwrap_or_default(),
        })
    }

    /// Computed layout of a live object. Idempotent; reflects current
    /// engine-side state, so re-reading after selection changes is valid.
    pub fn get_layout(&mut self, handle: Handle) -> Result<GenericLayout, EngineError> {
        let reply = self.call("GetLayout", json!([]), handle)?;
        let layout = reply
            .get("qLayout")
            .cloned()
            .ok_or_else(|| EngineError::Protocol("GetLayout reply carried no qLayout".to_string()))?;
        serde_json::from_value(layout).map_err(|e| EngineError::Protocol(e.to_string()))
    }

    /// Raw property definition of a live object.
    pub fn get_properties(&mut self, handle: Handle) -> Result<Value, EngineError> {
        let reply = self.call("GetProperties", json!([]), handle)?;
        Ok(reply.get("qProp").cloned().unwrap_or(Value::Null))
    }

    /// Destroy a session object by id. Returns the engine's success flag.
    pub fn destroy_session_object(&mut self, object_id: &str) -> Result<bool, EngineError> {
        let handle = self.document_handle_checked()?;
        let reply = self.call("DestroySessionObject", json!([object_id]), handle)?;
        Ok(reply
            .get("qReturn")
            .and_then(|r| r.get("qSuccess"))
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// Create a session object, hand it to `read`, and guarantee a destroy
    /// attempt afterwards — on the error path too. Destroy failures never
    /// mask a successful read; they surface as the cleanup warning.
    pub fn with_session_object<T>(
        &mut self,
        def: &SessionObjectDef,
        read: impl FnOnce(&mut Self, &ObjectRef) -> Result<T, EngineError>,
    ) -> Result<Fetched<T>, EngineError> {
        let object = self.create_session_object(def)?;
        let outcome = read(self, &object);

        let cleanup_warning = match self.destroy_session_object(&object.id) {
            Ok(_) => None,
            Err(err) => {
                log::warn!("failed to destroy session object {:?}: {}", object.id, err);
                Some(err.to_string())
            }
        };

        match outcome {
            Ok(value) => Ok(Fetched {
                value,
                cleanup_warning,
            }),
            Err(err) => Err(err),
        }
    }

    // ── Composite reads ─────────────────────────────────────────────

    /// Distinct values of one field, with selection state and (optionally)
    /// frequency ordering.
    pub fn field_values(
        &mut self,
        field: &str,
        max_values: usize,
        include_frequency: bool,
    ) -> Result<Fetched<FieldValues>, EngineError> {
        let def = SessionObjectDef::ValueList(
            ValueListDef::new(field)
                .max_values(max_values)
                .include_frequency(include_frequency),
        );
        self.with_session_object(&def, |session, object| {
            let layout = session.get_layout(object.handle)?;
            let list = layout.list_object.ok_or_else(|| {
                EngineError::Protocol("layout carried no qListObject".to_string())
            })?;
            Ok(list.field_values(field))
        })
    }

    /// One window of a dimensions x measures cross-tabulation.
    pub fn cross_tab(
        &mut self,
        dimensions: &[String],
        measures: &[String],
        max_rows: usize,
    ) -> Result<Fetched<CrossTabData>, EngineError> {
        let def = CrossTabDef::new(dimensions.to_vec(), measures.to_vec()).max_rows(max_rows);
        let columns: Vec<String> = dimensions.iter().chain(measures.iter()).cloned().collect();

        self.with_session_object(&SessionObjectDef::CrossTab(def), move |session, object| {
            let layout = session.get_layout(object.handle)?;
            let cube = layout.hyper_cube.ok_or_else(|| {
                EngineError::Protocol("layout carried no qHyperCube".to_string())
            })?;
            Ok(CrossTabData {
                columns,
                rows: cube.rows(),
                total_rows: cube.size.rows,
                total_columns: cube.size.columns,
            })
        })
    }

    /// Fetch a further page from a still-live cross-tab object (created via
    /// [`EngineSession::create_session_object`], destroyed by the caller).
    pub fn cross_tab_page(
        &mut self,
        handle: Handle,
        top: usize,
        left: usize,
        height: usize,
        width: usize,
    ) -> Result<Vec<Vec<Cell>>, EngineError> {
        let params = json!([{
            "qPath": "/qHyperCubeDef",
            "qPages": [{ "qTop": top, "qLeft": left, "qHeight": height, "qWidth": width }],
        }]);
        let reply = self.call("GetHyperCubeData", params, handle)?;

        let pages: Vec<qsense_protocol::DataPage> = reply
            .get("qDataPages")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| EngineError::Protocol(e.to_string()))?
            .unwrap_or_default();
        Ok(pages.into_iter().flat_map(|page| page.matrix).collect())
    }

    /// Aggregate statistics over one field, computed engine-side in a single
    /// measures-only hypercube.
    pub fn field_statistics(
        &mut self,
        field: &str,
    ) -> Result<Fetched<FieldStatistics>, EngineError> {
        let expressions = vec![
            format!("Count(DISTINCT [{}])", field),
            format!("Count([{}])", field),
            format!("Count({{$<[{}]={{'*'}}>}})", field),
            format!("Min([{}])", field),
            format!("Max([{}])", field),
            format!("Avg([{}])", field),
            format!("Sum([{}])", field),
            format!("Median([{}])", field),
            format!("Mode([{}])", field),
            format!("Stdev([{}])", field),
        ];
        let def = CrossTabDef::new(Vec::new(), expressions).max_rows(1);
        let field_name = field.to_string();

        self.with_session_object(&SessionObjectDef::CrossTab(def), move |session, object| {
            let layout = session.get_layout(object.handle)?;
            let cube = layout.hyper_cube.ok_or_else(|| {
                EngineError::Protocol("layout carried no qHyperCube".to_string())
            })?;
            let rows = cube.rows();
            let cells = rows.first().map(Vec::as_slice).unwrap_or(&[]);
            Ok(FieldStatistics::from_cells(field_name, cells))
        })
    }

    /// Catalog of existing app objects of one kind. An absent section reads
    /// as an empty catalog — the engine omits it for apps without such
    /// objects.
    pub fn catalog(&mut self, kind: CatalogKind) -> Result<Fetched<Vec<Value>>, EngineError> {
        self.with_session_object(&SessionObjectDef::Catalog(kind), move |session, object| {
            let layout = session.get_layout(object.handle)?;
            Ok(layout
                .catalog_items(kind.layout_section())
                .map(<[Value]>::to_vec)
                .unwrap_or_default())
        })
    }

    // ── Plain document calls ────────────────────────────────────────

    /// Evaluate an expression in the document's context.
    pub fn evaluate(&mut self, expression: &str) -> Result<Value, EngineError> {
        let handle = self.document_handle_checked()?;
        let reply = self.call("Evaluate", json!({ "qExpression": expression }), handle)?;
        Ok(reply.get("qReturn").cloned().unwrap_or(Value::Null))
    }

    /// Select values in a field. Returns the engine's acceptance flag.
    pub fn select_in_field(
        &mut self,
        field: &str,
        values: &[&str],
        toggle: bool,
    ) -> Result<bool, EngineError> {
        let handle = self.document_handle_checked()?;
        let params = json!({ "qFieldName": field, "qValues": values, "qToggleMode": toggle });
        let reply = self.call("SelectInField", params, handle)?;
        Ok(reply.get("qReturn").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Clear all selections, optionally including locked fields.
    pub fn clear_all(&mut self, locked_also: bool) -> Result<bool, EngineError> {
        let handle = self.document_handle_checked()?;
        let reply = self.call("ClearAll", json!({ "qLockedAlso": locked_also }), handle)?;
        Ok(reply.get("qReturn").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Current selections across all fields.
    pub fn current_selections(&mut self) -> Result<Vec<Value>, EngineError> {
        let handle = self.document_handle_checked()?;
        let reply = self.call("GetCurrentSelections", json!([]), handle)?;
        Ok(reply
            .get("qSelections")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Raw tables-and-keys tree (data model enumeration).
    pub fn tables_and_keys(&mut self) -> Result<Value, EngineError> {
        let handle = self.document_handle_checked()?;
        self.call(
            "GetTablesAndKeys",
            json!([
                { "qcx": 1000, "qcy": 1000 },
                { "qcx": 0, "qcy": 0 },
                30,
                true,
                false,
            ]),
            handle,
        )
    }

    /// Per-field view over [`EngineSession::tables_and_keys`]. The engine
    /// omits most per-field keys for system tables, so everything defaults.
    pub fn fields(&mut self) -> Result<Vec<FieldInfo>, EngineError> {
        let tree = self.tables_and_keys()?;
        let mut fields = Vec::new();

        for table in tree.get("qtr").and_then(Value::as_array).into_iter().flatten() {
            let table_name = table
                .get("qName")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string();
            for field in table.get("qFields").and_then(Value::as_array).into_iter().flatten() {
                fields.push(FieldInfo::from_raw(&table_name, field));
            }
        }
        Ok(fields)
    }

    /// App-level properties of the open document.
    pub fn app_properties(&mut self) -> Result<Value, EngineError> {
        let handle = self.document_handle_checked()?;
        self.call("GetAppProperties", json!([]), handle)
    }

    /// Saved bookmarks.
    pub fn bookmarks(&mut self) -> Result<Vec<Value>, EngineError> {
        let handle = self.document_handle_checked()?;
        let reply = self.call("GetBookmarkList", json!([]), handle)?;
        Ok(reply
            .get("qBookmarkList")
            .and_then(|l| l.get("qItems"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Apply a bookmark's saved selections.
    pub fn apply_bookmark(&mut self, bookmark_id: &str) -> Result<bool, EngineError> {
        let handle = self.document_handle_checked()?;
        let reply = self.call("ApplyBookmark", json!({ "qBookmarkId": bookmark_id }), handle)?;
        Ok(reply.get("qReturn").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Search app objects for terms, optionally restricted by object type.
    pub fn search_objects(
        &mut self,
        terms: &[&str],
        object_types: Option<&[&str]>,
    ) -> Result<Value, EngineError> {
        let handle = self.document_handle_checked()?;
        let mut options = json!({ "qSearchFields": ["*"], "qContext": "LockedFieldsOnly" });
        if let Some(types) = object_types {
            options["qTypes"] = json!(types);
        }
        let params = json!({
            "qOptions": options,
            "qTerms": terms,
            "qPage": { "qOffset": 0, "qCount": 100, "qMaxNbrFieldMatches": 5 },
        });
        let reply = self.call("SearchObjects", params, handle)?;
        Ok(reply.get("qResult").cloned().unwrap_or(Value::Null))
    }

    /// Search suggestions for field/value discovery.
    pub fn search_suggest(&mut self, terms: &[&str]) -> Result<Vec<Value>, EngineError> {
        let handle = self.document_handle_checked()?;
        let params = json!({
            "qSuggestions": { "qSuggestionTypes": ["Field", "Value", "Object"] },
            "qTerms": terms,
        });
        let reply = self.call("SearchSuggest", params, handle)?;
        Ok(reply
            .get("qResult")
            .and_then(|r| r.get("qSuggestions"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Combined field and variable enumeration.
    pub fn field_and_variable_list(&mut self) -> Result<Value, EngineError> {
        let handle = self.document_handle_checked()?;
        self.call("GetFieldAndVariableList", json!({}), handle)
    }

    /// Handle of an existing (persisted) object by id.
    pub fn get_object(&mut self, object_id: &str) -> Result<Handle, EngineError> {
        let handle = self.document_handle_checked()?;
        let reply = self.call("GetObject", json!({ "qId": object_id }), handle)?;
        let object_handle = reply
            .get("qReturn")
            .and_then(|r| r.get("qHandle"))
            .and_then(Value::as_i64)
            .map(Handle)
            .filter(|h| h.is_valid());
        object_handle.ok_or_else(|| {
            EngineError::Protocol(format!("GetObject({:?}) reply carried no handle", object_id))
        })
    }

    /// Layout of an existing (persisted) object by id.
    pub fn object_layout(&mut self, object_id: &str) -> Result<GenericLayout, EngineError> {
        let handle = self.get_object(object_id)?;
        self.get_layout(handle)
    }

    /// Ask the engine to export an object's data server-side.
    pub fn export_object_data(
        &mut self,
        object_id: &str,
        path: &str,
    ) -> Result<Value, EngineError> {
        let handle = self.document_handle_checked()?;
        let params = json!({ "qObjectId": object_id, "qPath": path, "qExportState": "A" });
        self.call("ExportData", params, handle)
    }
}

// =============================================================================
// Reshaped outputs
// =============================================================================

/// One statistic: the engine's text rendering plus the numeric value when
/// there is one.
#[derive(Debug, Clone, Serialize)]
pub struct StatValue {
    pub text: String,
    pub numeric: Option<f64>,
}

/// Engine-computed aggregate statistics over one field.
#[derive(Debug, Clone, Serialize)]
pub struct FieldStatistics {
    pub field_name: String,
    /// Keyed by statistic label (`unique_values`, `total_count`, ...).
    pub values: BTreeMap<String, StatValue>,
    pub null_percentage: Option<f64>,
    pub completeness_percentage: Option<f64>,
}

impl FieldStatistics {
    fn from_cells(field_name: String, cells: &[Cell]) -> Self {
        let mut values = BTreeMap::new();
        for (label, cell) in STAT_LABELS.iter().zip(cells) {
            values.insert(
                label.to_string(),
                StatValue {
                    text: cell.text().to_string(),
                    numeric: cell.num,
                },
            );
        }

        let total = values.get("total_count").and_then(|v| v.numeric);
        let non_null = values.get("non_null_count").and_then(|v| v.numeric);
        let (null_percentage, completeness_percentage) = match (total, non_null) {
            (Some(total), Some(non_null)) if total > 0.0 => (
                Some(round2((total - non_null) / total * 100.0)),
                Some(round2(non_null / total * 100.0)),
            ),
            _ => (None, None),
        };

        Self {
            field_name,
            values,
            null_percentage,
            completeness_percentage,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// One field of the data model, flattened from the tables-and-keys tree.
#[derive(Debug, Clone, Serialize)]
pub struct FieldInfo {
    pub field_name: String,
    pub table_name: String,
    pub data_type: String,
    pub is_key: bool,
    pub is_system: bool,
    pub is_hidden: bool,
    pub distinct_values: i64,
    pub rows_count: i64,
    pub tags: Vec<String>,
}

impl FieldInfo {
    fn from_raw(table_name: &str, raw: &Value) -> Self {
        let text = |key: &str| {
            raw.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let flag = |key: &str| raw.get(key).and_then(Value::as_bool).unwrap_or(false);
        let count = |key: &str| raw.get(key).and_then(Value::as_i64).unwrap_or(0);

        Self {
            field_name: text("qName"),
            table_name: table_name.to_string(),
            data_type: text("qType"),
            is_key: flag("qIsKey"),
            is_system: flag("qIsSystem"),
            is_hidden: flag("qIsHidden"),
            distinct_values: count("qnTotalDistinctValues"),
            rows_count: count("qnRows"),
            tags: raw
                .get("qTags")
                .and_then(Value::as_array)
                .map(|tags| {
                    tags.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cell(text: &str, num: Option<f64>) -> Cell {
        serde_json::from_value(match num {
            Some(n) => json!({ "qText": text, "qNum": n, "qIsNumeric": true }),
            None => json!({ "qText": text, "qNum": "NaN" }),
        })
        .unwrap()
    }

    #[test]
    fn statistics_derive_percentages() {
        let cells = vec![
            cell("120", Some(120.0)),  // unique_values
            cell("1000", Some(1000.0)), // total_count
            cell("900", Some(900.0)),  // non_null_count
        ];
        let stats = FieldStatistics::from_cells("Country".into(), &cells);

        assert_eq!(stats.values["total_count"].numeric, Some(1000.0));
        assert_eq!(stats.null_percentage, Some(10.0));
        assert_eq!(stats.completeness_percentage, Some(90.0));
        // Only three expressions came back; the rest stay absent.
        assert!(!stats.values.contains_key("std_deviation"));
    }

    #[test]
    fn statistics_tolerate_non_numeric_counts() {
        let cells = vec![cell("-", None), cell("-", None), cell("-", None)];
        let stats = FieldStatistics::from_cells("Notes".into(), &cells);
        assert!(stats.null_percentage.is_none());
        assert!(stats.completeness_percentage.is_none());
    }

    #[test]
    fn field_info_from_sparse_tree() {
        let raw = json!({
            "qName": "OrderID",
            "qIsKey": true,
            "qnRows": 5000,
            "qTags": ["$key", "$numeric"],
        });
        let info = FieldInfo::from_raw("Orders", &raw);
        assert_eq!(info.field_name, "OrderID");
        assert_eq!(info.table_name, "Orders");
        assert!(info.is_key);
        assert!(!info.is_system);
        assert_eq!(info.rows_count, 5000);
        assert_eq!(info.distinct_values, 0);
        assert_eq!(info.tags, vec!["$key", "$numeric"]);
        assert_eq!(info.data_type, "");
    }
}
