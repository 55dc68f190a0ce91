//! Core domain types shared across all bbqscan crates.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BbqScanError, Result};

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Fields and values
// ---------------------------------------------------------------------------

/// The product fields that go through reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldName {
    ProductName,
    OriginalPrice,
    DiscountPrice,
    PercentageDiscount,
}

impl FieldName {
    /// Every reconciled field, in output column order.
    pub const ALL: [FieldName; 4] = [
        FieldName::ProductName,
        FieldName::OriginalPrice,
        FieldName::DiscountPrice,
        FieldName::PercentageDiscount,
    ];

    /// JSON key used by the extraction capability.
    pub fn key(self) -> &'static str {
        match self {
            Self::ProductName => "product_name",
            Self::OriginalPrice => "original_price",
            Self::DiscountPrice => "discount_price",
            Self::PercentageDiscount => "percentage_discount",
        }
    }

    fn is_text(self) -> bool {
        matches!(self, Self::ProductName)
    }
}

/// One observed value of a field. `Absent` is a real value and takes part in votes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Absent,
    Text(String),
    Decimal(Decimal),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Decimal(d) => Some(*d),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "<absent>"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Decimal(d) => write!(f, "{d}"),
        }
    }
}

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    // "2.–" and "2.-" are the leaflet way of writing 2.00
    Regex::new(r"(\d+)(?:[.,](\d+|[-–]))?").expect("valid regex")
});

const ABSENT_MARKERS: [&str; 6] = ["", "null", "none", "n/a", "-", "–"];

/// Parse a price or percentage as printed on a leaflet.
///
/// Accepts currency prefixes (`CHF 3.50`), decimal commas (`4,20`), Swiss
/// thousands separators (`1'299.00`), dash cents (`2.–`) and percent signs.
/// Returns `None` when the text carries no number at all.
pub fn parse_price_text(text: &str) -> Option<FieldValue> {
    let trimmed = text.trim();
    if ABSENT_MARKERS.contains(&trimmed.to_lowercase().as_str()) {
        return Some(FieldValue::Absent);
    }

    let cleaned = trimmed.replace(['\'', '’'], "");
    let caps = NUMBER_RE.captures(&cleaned)?;
    let whole = caps.get(1)?.as_str();
    let number = match caps.get(2).map(|m| m.as_str()) {
        Some(frac) if frac.chars().all(|c| c.is_ascii_digit()) => format!("{whole}.{frac}"),
        _ => whole.to_string(),
    };

    Decimal::from_str(&number).ok().map(FieldValue::Decimal)
}

/// Interpret one JSON field of a capability answer.
///
/// `None` means the entry is malformed for this field (missing key or wrong
/// type); `Some(FieldValue::Absent)` is an explicit "not on the page".
pub fn parse_field(field: FieldName, value: Option<&Value>) -> Option<FieldValue> {
    let value = value?;
    match (field.is_text(), value) {
        (_, Value::Null) => Some(FieldValue::Absent),
        (true, Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                Some(FieldValue::Absent)
            } else {
                Some(FieldValue::Text(s.to_string()))
            }
        }
        (true, _) => None,
        (false, Value::Number(n)) => {
            let repr = n.to_string();
            Decimal::from_str(&repr)
                .or_else(|_| Decimal::from_scientific(&repr))
                .ok()
                .map(FieldValue::Decimal)
        }
        (false, Value::String(s)) => parse_price_text(s),
        (false, _) => None,
    }
}

// ---------------------------------------------------------------------------
// ProductRecord
// ---------------------------------------------------------------------------

/// One observation of a product on a page, as returned by primary extraction.
///
/// Identity is positional: (page-group, page, ordinal in the extraction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub product_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage_discount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_details: Option<String>,
}

impl ProductRecord {
    /// A record with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            product_name: name.into(),
            original_price: None,
            discount_price: None,
            percentage_discount: None,
            discount_details: None,
        }
    }

    /// The record's value for a reconciled field.
    pub fn field(&self, field: FieldName) -> FieldValue {
        let price = |p: Option<Decimal>| p.map_or(FieldValue::Absent, FieldValue::Decimal);
        match field {
            FieldName::ProductName => FieldValue::Text(self.product_name.clone()),
            FieldName::OriginalPrice => price(self.original_price),
            FieldName::DiscountPrice => price(self.discount_price),
            FieldName::PercentageDiscount => price(self.percentage_discount),
        }
    }

    /// Build a record from a primary extraction object.
    ///
    /// A record without a usable name is rejected. Unreadable prices are kept
    /// as absent so the rest of the record survives.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| BbqScanError::contract(format!("product is not an object: {value}")))?;

        let product_name = match parse_field(FieldName::ProductName, obj.get("product_name")) {
            Some(FieldValue::Text(name)) => name,
            _ => {
                return Err(BbqScanError::contract(format!(
                    "product without a name: {value}"
                )));
            }
        };

        let price = |field: FieldName| match parse_field(field, obj.get(field.key())) {
            Some(FieldValue::Decimal(d)) => Some(d),
            Some(_) => None,
            None => {
                if obj.contains_key(field.key()) {
                    tracing::warn!(
                        product = %product_name,
                        field = field.key(),
                        "unreadable value in extraction, treating as absent"
                    );
                }
                None
            }
        };

        let discount_details = obj
            .get("discount_details")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);

        Ok(Self {
            original_price: price(FieldName::OriginalPrice),
            discount_price: price(FieldName::DiscountPrice),
            percentage_discount: price(FieldName::PercentageDiscount),
            product_name,
            discount_details,
        })
    }
}

// ---------------------------------------------------------------------------
// ValidationEntry
// ---------------------------------------------------------------------------

/// One re-validation observation. A `None` field is malformed and does not vote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationEntry {
    pub product_name: Option<FieldValue>,
    pub original_price: Option<FieldValue>,
    pub discount_price: Option<FieldValue>,
    pub percentage_discount: Option<FieldValue>,
}

impl ValidationEntry {
    /// Interpret a validation object; anything that is not an object is malformed throughout.
    pub fn from_json(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };
        let get = |field: FieldName| parse_field(field, obj.get(field.key()));
        Self {
            product_name: get(FieldName::ProductName),
            original_price: get(FieldName::OriginalPrice),
            discount_price: get(FieldName::DiscountPrice),
            percentage_discount: get(FieldName::PercentageDiscount),
        }
    }

    pub fn get(&self, field: FieldName) -> Option<&FieldValue> {
        match field {
            FieldName::ProductName => self.product_name.as_ref(),
            FieldName::OriginalPrice => self.original_price.as_ref(),
            FieldName::DiscountPrice => self.discount_price.as_ref(),
            FieldName::PercentageDiscount => self.percentage_discount.as_ref(),
        }
    }
}

impl From<&ProductRecord> for ValidationEntry {
    fn from(record: &ProductRecord) -> Self {
        Self {
            product_name: Some(record.field(FieldName::ProductName)),
            original_price: Some(record.field(FieldName::OriginalPrice)),
            discount_price: Some(record.field(FieldName::DiscountPrice)),
            percentage_discount: Some(record.field(FieldName::PercentageDiscount)),
        }
    }
}

/// Reconciled value of one field plus the share of validation votes behind it.
///
/// `confidence` is `None` when no validation pass produced a usable value.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledField {
    pub value: FieldValue,
    pub confidence: Option<f64>,
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// The nine coarse categories assigned in the first classification stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoarseCategory {
    #[serde(rename = "Geflügel")]
    Poultry,
    #[serde(rename = "Schwein")]
    Pork,
    #[serde(rename = "Rind")]
    Beef,
    #[serde(rename = "Gemischt")]
    MixedMeat,
    #[serde(rename = "Käse")]
    Cheese,
    #[serde(rename = "Fisch & Meeresfrüchte")]
    FishSeafood,
    #[serde(rename = "Vegetarisches oder veganes Ersatzprodukt")]
    VegetarianSubstitute,
    #[serde(rename = "Grillgemüse")]
    GrillVegetables,
    #[serde(rename = "other")]
    Other,
}

impl CoarseCategory {
    pub const ALL: [CoarseCategory; 9] = [
        Self::Poultry,
        Self::Pork,
        Self::Beef,
        Self::MixedMeat,
        Self::Cheese,
        Self::FishSeafood,
        Self::VegetarianSubstitute,
        Self::GrillVegetables,
        Self::Other,
    ];

    /// The label the classification capability answers with.
    pub fn label(self) -> &'static str {
        match self {
            Self::Poultry => "Geflügel",
            Self::Pork => "Schwein",
            Self::Beef => "Rind",
            Self::MixedMeat => "Gemischt",
            Self::Cheese => "Käse",
            Self::FishSeafood => "Fisch & Meeresfrüchte",
            Self::VegetarianSubstitute => "Vegetarisches oder veganes Ersatzprodukt",
            Self::GrillVegetables => "Grillgemüse",
            Self::Other => "other",
        }
    }

    /// Look up a category by label, ignoring case and surrounding whitespace.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.label().to_lowercase() == label.to_lowercase())
    }
}

impl std::fmt::Display for CoarseCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// The category a row ends up with after both stages are reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinalCategory {
    #[serde(rename = "Geflügel")]
    Poultry,
    #[serde(rename = "Schwein")]
    Pork,
    #[serde(rename = "Rind")]
    Beef,
    #[serde(rename = "Gemischt")]
    MixedMeat,
    #[serde(rename = "Käse")]
    Cheese,
    #[serde(rename = "Fisch & Meeresfrüchte")]
    FishSeafood,
    #[serde(rename = "Vegetarisches oder veganes Ersatzprodukt")]
    VegetarianSubstitute,
    #[serde(rename = "Grillgemüse")]
    GrillVegetables,
    #[serde(rename = "Kein Grillprodukt")]
    NoGrillProduct,
}

impl FinalCategory {
    pub fn label(self) -> &'static str {
        match self {
            Self::NoGrillProduct => "Kein Grillprodukt",
            Self::Poultry => CoarseCategory::Poultry.label(),
            Self::Pork => CoarseCategory::Pork.label(),
            Self::Beef => CoarseCategory::Beef.label(),
            Self::MixedMeat => CoarseCategory::MixedMeat.label(),
            Self::Cheese => CoarseCategory::Cheese.label(),
            Self::FishSeafood => CoarseCategory::FishSeafood.label(),
            Self::VegetarianSubstitute => CoarseCategory::VegetarianSubstitute.label(),
            Self::GrillVegetables => CoarseCategory::GrillVegetables.label(),
        }
    }
}

impl From<CoarseCategory> for FinalCategory {
    fn from(category: CoarseCategory) -> Self {
        match category {
            CoarseCategory::Poultry => Self::Poultry,
            CoarseCategory::Pork => Self::Pork,
            CoarseCategory::Beef => Self::Beef,
            CoarseCategory::MixedMeat => Self::MixedMeat,
            CoarseCategory::Cheese => Self::Cheese,
            CoarseCategory::FishSeafood => Self::FishSeafood,
            CoarseCategory::VegetarianSubstitute => Self::VegetarianSubstitute,
            CoarseCategory::GrillVegetables => Self::GrillVegetables,
            CoarseCategory::Other => Self::NoGrillProduct,
        }
    }
}

impl std::fmt::Display for FinalCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Stage 1 answer for one product, exactly as the capability labelled it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoarseVerdict {
    pub category: String,
    pub certainty: u8,
}

/// Stage 2 answer for one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrillVerdict {
    pub is_grill: bool,
    pub certainty: u8,
}

/// Both classification stages for one row. `grill` is filled by stage 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryAssignment {
    pub category: CoarseCategory,
    pub certainty: u8,
    pub grill: Option<GrillVerdict>,
}

/// The single category and certainty a row is reported with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalClassification {
    pub category: FinalCategory,
    pub certainty: u8,
}

impl CategoryAssignment {
    /// Collapse both stages into one classification; `None` until stage 2 ran.
    pub fn reduce(&self) -> Option<FinalClassification> {
        let grill = self.grill?;
        let category = if grill.is_grill {
            FinalCategory::from(self.category)
        } else {
            FinalCategory::NoGrillProduct
        };
        Some(FinalClassification {
            category,
            certainty: self.certainty.min(grill.certainty),
        })
    }
}

// ---------------------------------------------------------------------------
// Result tables
// ---------------------------------------------------------------------------

/// One row of a persisted result table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    /// Page-group the row came from.
    pub folder: String,
    /// Image file name within the page-group.
    pub page: String,
    /// Ordinal of the product in the image's extraction.
    pub index: u32,

    pub extracted_product_name: String,
    pub extracted_original_price: Option<Decimal>,
    pub extracted_discount_price: Option<Decimal>,
    pub extracted_percentage_discount: Option<Decimal>,
    pub extracted_discount_details: Option<String>,

    pub final_product_name: Option<String>,
    pub final_original_price: Option<Decimal>,
    pub final_discount_price: Option<Decimal>,
    pub final_percentage_discount: Option<Decimal>,

    pub confidence_product_name: Option<f64>,
    pub confidence_original_price: Option<f64>,
    pub confidence_discount_price: Option<f64>,
    pub confidence_percentage_discount: Option<f64>,

    pub category: Option<CoarseCategory>,
    pub certainty_category: Option<u8>,
    pub is_grill: Option<bool>,
    pub certainty_is_grill: Option<u8>,
    pub final_category: Option<FinalCategory>,
    pub final_certainty: Option<u8>,

    pub date_collected: Option<NaiveDate>,
    pub calendar_week: Option<u32>,
}

impl ResultRow {
    /// A row holding only the primary extraction.
    pub fn extracted(folder: &str, page: &str, index: u32, record: &ProductRecord) -> Self {
        Self {
            folder: folder.to_string(),
            page: page.to_string(),
            index,
            extracted_product_name: record.product_name.clone(),
            extracted_original_price: record.original_price,
            extracted_discount_price: record.discount_price,
            extracted_percentage_discount: record.percentage_discount,
            extracted_discount_details: record.discount_details.clone(),
            final_product_name: None,
            final_original_price: None,
            final_discount_price: None,
            final_percentage_discount: None,
            confidence_product_name: None,
            confidence_original_price: None,
            confidence_discount_price: None,
            confidence_percentage_discount: None,
            category: None,
            certainty_category: None,
            is_grill: None,
            certainty_is_grill: None,
            final_category: None,
            final_certainty: None,
            date_collected: None,
            calendar_week: None,
        }
    }

    /// Store the reconciled value and confidence of one field.
    pub fn set_reconciled(&mut self, field: FieldName, reconciled: &ReconciledField) {
        let confidence = reconciled.confidence;
        match field {
            FieldName::ProductName => {
                self.final_product_name = reconciled.value.as_text().map(String::from);
                self.confidence_product_name = confidence;
            }
            FieldName::OriginalPrice => {
                self.final_original_price = reconciled.value.as_decimal();
                self.confidence_original_price = confidence;
            }
            FieldName::DiscountPrice => {
                self.final_discount_price = reconciled.value.as_decimal();
                self.confidence_discount_price = confidence;
            }
            FieldName::PercentageDiscount => {
                self.final_percentage_discount = reconciled.value.as_decimal();
                self.confidence_percentage_discount = confidence;
            }
        }
    }

    /// Store both classification stages and their reduction.
    pub fn set_assignment(&mut self, assignment: &CategoryAssignment) {
        self.category = Some(assignment.category);
        self.certainty_category = Some(assignment.certainty);
        self.is_grill = assignment.grill.map(|g| g.is_grill);
        self.certainty_is_grill = assignment.grill.map(|g| g.certainty);
        if let Some(final_class) = assignment.reduce() {
            self.final_category = Some(final_class.category);
            self.final_certainty = Some(final_class.certainty);
        }
    }

    /// The name handed to classification: reconciled if available, else extracted.
    pub fn classification_name(&self) -> &str {
        self.final_product_name
            .as_deref()
            .unwrap_or(&self.extracted_product_name)
    }
}

/// An ordered table of result rows for one page-group or a whole run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    pub rows: Vec<ResultRow>,
}

impl ResultTable {
    pub fn new(rows: Vec<ResultRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row-wise union, preserving table order.
    pub fn concat(tables: impl IntoIterator<Item = ResultTable>) -> Self {
        Self {
            rows: tables.into_iter().flat_map(|t| t.rows).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// PageGroupState
// ---------------------------------------------------------------------------

/// Progress of one page-group through a run. `Persisted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageGroupState {
    Untouched,
    ImagesPrepared,
    Extracted,
    Classified,
    Persisted,
}

impl PageGroupState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untouched => "untouched",
            Self::ImagesPrepared => "images-prepared",
            Self::Extracted => "extracted",
            Self::Classified => "classified",
            Self::Persisted => "persisted",
        }
    }
}

impl std::fmt::Display for PageGroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PageGroupState {
    type Err = BbqScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "untouched" => Ok(Self::Untouched),
            "images-prepared" => Ok(Self::ImagesPrepared),
            "extracted" => Ok(Self::Extracted),
            "classified" => Ok(Self::Classified),
            "persisted" => Ok(Self::Persisted),
            other => Err(BbqScanError::parse(format!("unknown page-group state: {other}"))),
        }
    }
}
