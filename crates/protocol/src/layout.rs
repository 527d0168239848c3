//! Computed layouts.
//!
//! `GetLayout` returns a result tree whose sections depend on the object
//! kind; the engine omits keys freely, so every section here is optional and
//! every struct tolerates missing fields. Sections this library does not
//! interpret stay available through `extra`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// The `qLayout` tree of one session object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenericLayout {
    #[serde(rename = "qInfo", default)]
    pub info: Option<LayoutInfo>,
    #[serde(rename = "qListObject", default)]
    pub list_object: Option<ListObjectLayout>,
    #[serde(rename = "qHyperCube", default)]
    pub hyper_cube: Option<HyperCubeLayout>,
    #[serde(rename = "qAppObjectList", default)]
    pub app_object_list: Option<ItemList>,
    #[serde(rename = "qMeasureList", default)]
    pub measure_list: Option<ItemList>,
    #[serde(rename = "qDimensionList", default)]
    pub dimension_list: Option<ItemList>,
    #[serde(rename = "qVariableList", default)]
    pub variable_list: Option<ItemList>,
    /// Everything else in the layout, untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenericLayout {
    /// Items of the catalog section stored under `section` ("qMeasureList",
    /// "qAppObjectList", ...), if present.
    pub fn catalog_items(&self, section: &str) -> Option<&[Value]> {
        let list = match section {
            "qAppObjectList" => self.app_object_list.as_ref(),
            "qMeasureList" => self.measure_list.as_ref(),
            "qDimensionList" => self.dimension_list.as_ref(),
            "qVariableList" => self.variable_list.as_ref(),
            _ => return None,
        };
        list.map(|l| l.items.as_slice())
    }
}

/// `qInfo` of a laid-out object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LayoutInfo {
    #[serde(rename = "qId", default)]
    pub id: Option<String>,
    #[serde(rename = "qType", default)]
    pub object_type: Option<String>,
}

/// A catalog section: just its items.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemList {
    #[serde(rename = "qItems", default)]
    pub items: Vec<Value>,
}

/// Row/column extent of a computed table.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TableSize {
    #[serde(rename = "qcx", default)]
    pub columns: i64,
    #[serde(rename = "qcy", default)]
    pub rows: i64,
}

/// `qListObject` section of a value-list layout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListObjectLayout {
    #[serde(rename = "qSize", default)]
    pub size: TableSize,
    #[serde(rename = "qDimensionInfo", default)]
    pub dimension_info: Option<Value>,
    #[serde(rename = "qDataPages", default)]
    pub data_pages: Vec<DataPage>,
}

impl ListObjectLayout {
    /// Flatten the fetched pages into per-value rows.
    pub fn field_values(&self, field_name: &str) -> FieldValues {
        let mut values = Vec::new();
        for page in &self.data_pages {
            for row in &page.matrix {
                if let Some(cell) = row.first() {
                    values.push(FieldValue::from_cell(cell));
                }
            }
        }
        FieldValues {
            field_name: field_name.to_string(),
            total_values: self.size.rows,
            returned: values.len(),
            values,
        }
    }
}

/// `qHyperCube` section of a cross-tab layout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HyperCubeLayout {
    #[serde(rename = "qSize", default)]
    pub size: TableSize,
    #[serde(rename = "qDimensionInfo", default)]
    pub dimension_info: Vec<Value>,
    #[serde(rename = "qMeasureInfo", default)]
    pub measure_info: Vec<Value>,
    #[serde(rename = "qDataPages", default)]
    pub data_pages: Vec<DataPage>,
}

impl HyperCubeLayout {
    /// All rows across the fetched pages.
    pub fn rows(&self) -> Vec<Vec<Cell>> {
        self.data_pages
            .iter()
            .flat_map(|page| page.matrix.iter().cloned())
            .collect()
    }
}

/// One fetched data window.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataPage {
    #[serde(rename = "qMatrix", default)]
    pub matrix: Vec<Vec<Cell>>,
    #[serde(rename = "qArea", default)]
    pub area: Option<Value>,
}

/// One table cell. `qNum` arrives as a JSON number or as the string `"NaN"`;
/// the latter reads as absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cell {
    #[serde(rename = "qText", default)]
    pub text: Option<String>,
    #[serde(rename = "qNum", default, deserialize_with = "lenient_number")]
    pub num: Option<f64>,
    #[serde(rename = "qIsNumeric", default)]
    pub is_numeric: bool,
    /// Selection state: O=optional, S=selected, A=alternative, X=excluded.
    #[serde(rename = "qState", default)]
    pub state: Option<String>,
    #[serde(rename = "qFrequency", default)]
    pub frequency: Option<String>,
    #[serde(rename = "qElemNumber", default)]
    pub elem_number: Option<i64>,
}

impl Cell {
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::Number(n)) => n.as_f64().filter(|v| v.is_finite()),
        // "NaN" and any other non-numeric placeholder mean "no number"
        _ => None,
    })
}

// =============================================================================
// Reshaped views consumed by reporting layers
// =============================================================================

/// One field value with its selection state and optional frequency.
#[derive(Debug, Clone, Serialize)]
pub struct FieldValue {
    pub text: String,
    pub state: String,
    pub numeric: Option<f64>,
    pub is_numeric: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
}

impl FieldValue {
    fn from_cell(cell: &Cell) -> Self {
        Self {
            text: cell.text().to_string(),
            state: cell.state.clone().unwrap_or_else(|| "O".to_string()),
            numeric: cell.num,
            is_numeric: cell.is_numeric,
            frequency: cell.frequency.clone(),
        }
    }
}

/// The distinct values of one field, flattened from a value-list layout.
#[derive(Debug, Clone, Serialize)]
pub struct FieldValues {
    pub field_name: String,
    pub values: Vec<FieldValue>,
    /// Total distinct values engine-side; may exceed `returned`.
    pub total_values: i64,
    pub returned: usize,
}

/// A cross-tabulation's fetched window plus its engine-side extent.
#[derive(Debug, Clone, Serialize)]
pub struct CrossTabData {
    /// Column labels: dimensions first, then measures.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    pub total_rows: i64,
    pub total_columns: i64,
}
