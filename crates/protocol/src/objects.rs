//! Session object definitions.
//!
//! A session object is a transient, engine-side computed object created from
//! a JSON property tree and addressed by the handle the engine returns. The
//! kinds this library interprets get explicit definition types; anything else
//! goes through [`SessionObjectDef::Opaque`] untouched.

use serde_json::{json, Value};

/// Default row window for a value list.
pub const DEFAULT_MAX_VALUES: usize = 100;

/// Default row window for a cross-tabulation.
pub const DEFAULT_MAX_ROWS: usize = 1000;

/// What the engine should compute for a session object.
#[derive(Debug, Clone)]
pub enum SessionObjectDef {
    /// Distinct values of one field (ListObject).
    ValueList(ValueListDef),
    /// Dimensions x measures cross-tabulation (straight hypercube).
    CrossTab(CrossTabDef),
    /// Catalog of existing app objects of one kind.
    Catalog(CatalogKind),
    /// Raw property tree, passed through unmodified.
    Opaque(Value),
}

impl SessionObjectDef {
    /// Build the `qProp` property tree sent to `CreateSessionObject`.
    pub fn properties(&self) -> Value {
        match self {
            SessionObjectDef::ValueList(def) => def.properties(),
            SessionObjectDef::CrossTab(def) => def.properties(),
            SessionObjectDef::Catalog(kind) => kind.properties(),
            SessionObjectDef::Opaque(props) => props.clone(),
        }
    }
}

/// Distinct values of one field, optionally ordered by frequency.
#[derive(Debug, Clone)]
pub struct ValueListDef {
    pub field: String,
    pub max_values: usize,
    pub include_frequency: bool,
}

impl ValueListDef {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            max_values: DEFAULT_MAX_VALUES,
            include_frequency: true,
        }
    }

    pub fn max_values(mut self, max_values: usize) -> Self {
        self.max_values = max_values;
        self
    }

    pub fn include_frequency(mut self, include: bool) -> Self {
        self.include_frequency = include;
        self
    }

    /// Id the object is filed under; deterministic so a destroy/recreate
    /// cycle for the same field is idempotent.
    pub fn object_id(&self) -> String {
        format!("field-values-{}", self.field)
    }

    fn properties(&self) -> Value {
        json!({
            "qInfo": { "qId": self.object_id(), "qType": "ListObject" },
            "qListObjectDef": {
                "qStateName": "$",
                "qLibraryId": "",
                "qDef": {
                    "qFieldDefs": [self.field],
                    "qFieldLabels": [],
                    "qSortCriterias": [{
                        "qSortByState": 0,
                        "qSortByFrequency": if self.include_frequency { 1 } else { 0 },
                        "qSortByNumeric": 1,
                        "qSortByAscii": 1,
                        "qSortByLoadOrder": 0,
                        "qSortByExpression": 0,
                        "qExpression": { "qv": "" },
                    }],
                },
                "qInitialDataFetch": [{
                    "qTop": 0,
                    "qLeft": 0,
                    "qHeight": self.max_values,
                    "qWidth": 1,
                }],
            },
        })
    }
}

/// A straight-mode hypercube over dimensions and measures, with an initial
/// page sized to `max_rows`.
#[derive(Debug, Clone)]
pub struct CrossTabDef {
    pub dimensions: Vec<String>,
    pub measures: Vec<String>,
    pub max_rows: usize,
}

impl CrossTabDef {
    pub fn new(dimensions: Vec<String>, measures: Vec<String>) -> Self {
        Self {
            dimensions,
            measures,
            max_rows: DEFAULT_MAX_ROWS,
        }
    }

    pub fn max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn object_id(&self) -> String {
        format!("hypercube-{}d-{}m", self.dimensions.len(), self.measures.len())
    }

    /// Total column count of the computed table (dimensions then measures).
    pub fn width(&self) -> usize {
        self.dimensions.len() + self.measures.len()
    }

    fn properties(&self) -> Value {
        let dimensions: Vec<Value> = self
            .dimensions
            .iter()
            .map(|dim| {
                json!({
                    "qDef": {
                        "qFieldDefs": [dim],
                        "qSortCriterias": [{
                            "qSortByState": 0,
                            "qSortByFrequency": 0,
                            "qSortByNumeric": 1,
                            "qSortByAscii": 1,
                            "qSortByLoadOrder": 0,
                            "qSortByExpression": 0,
                            "qExpression": { "qv": "" },
                        }],
                    },
                    "qNullSuppression": false,
                    "qIncludeElemValue": true,
                })
            })
            .collect();

        let measures: Vec<Value> = self
            .measures
            .iter()
            .enumerate()
            .map(|(i, measure)| {
                json!({
                    "qDef": { "qDef": measure, "qLabel": format!("Measure_{}", i) },
                    "qSortBy": { "qSortByNumeric": -1, "qSortByLoadOrder": 0 },
                })
            })
            .collect();

        json!({
            "qInfo": { "qId": self.object_id(), "qType": "HyperCube" },
            "qHyperCubeDef": {
                "qDimensions": dimensions,
                "qMeasures": measures,
                "qInitialDataFetch": [{
                    "qTop": 0,
                    "qLeft": 0,
                    "qHeight": self.max_rows,
                    "qWidth": self.width(),
                }],
                "qSuppressZero": false,
                "qSuppressMissing": false,
                "qMode": "S",
                "qInterColumnSortOrder": (0..self.width()).collect::<Vec<_>>(),
            },
        })
    }
}

/// Catalogs of existing app objects, one list definition per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    /// Sheets with their metadata and cell layout.
    Sheets,
    /// Master measures.
    Measures,
    /// Master dimensions.
    Dimensions,
    /// Variables, including reserved and script-created ones.
    Variables,
}

impl CatalogKind {
    /// Key under which the computed layout carries this catalog's items.
    pub fn layout_section(self) -> &'static str {
        match self {
            CatalogKind::Sheets => "qAppObjectList",
            CatalogKind::Measures => "qMeasureList",
            CatalogKind::Dimensions => "qDimensionList",
            CatalogKind::Variables => "qVariableList",
        }
    }

    fn properties(self) -> Value {
        match self {
            CatalogKind::Sheets => json!({
                "qInfo": { "qType": "SheetList" },
                "qAppObjectListDef": {
                    "qType": "sheet",
                    "qData": {
                        "title": "/qMetaDef/title",
                        "description": "/qMetaDef/description",
                        "thumbnail": "/thumbnail",
                        "cells": "/cells",
                        "rank": "/rank",
                        "columns": "/columns",
                        "rows": "/rows",
                    },
                },
            }),
            CatalogKind::Measures => json!({
                "qInfo": { "qType": "MeasureList" },
                "qMeasureListDef": {
                    "qType": "measure",
                    "qData": {
                        "title": "/title",
                        "tags": "/tags",
                        "description": "/qMeta/description",
                        "expression": "/qMeasure/qDef",
                    },
                },
            }),
            CatalogKind::Dimensions => json!({
                "qInfo": { "qType": "DimensionList" },
                "qDimensionListDef": {
                    "qType": "dimension",
                    "qData": {
                        "title": "/title",
                        "tags": "/tags",
                        "grouping": "/qDim/qGrouping",
                        "info": "/qDimInfos",
                        "description": "/qMeta/description",
                        "expression": "/qDim/qFieldDefs",
                    },
                },
            }),
            CatalogKind::Variables => json!({
                "qInfo": { "qType": "VariableList" },
                "qVariableListDef": {
                    "qType": "variable",
                    "qShowReserved": true,
                    "qShowConfig": true,
                    "qData": { "tags": "/tags" },
                },
            }),
        }
    }
}
