use std::collections::HashMap;

use lazy_static::lazy_static;
use polars::prelude::{
    col, DataFrame, DataType, Field, IntoLazy, NamedFrom, PolarsResult, Schema, Series,
};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, StrokeError};

pub const ID_COLUMN: &str = "id";
pub const TARGET_COLUMN: &str = "stroke";

/// Source value for a missing BMI.
const MISSING_BMI: &str = "N/A";

lazy_static! {
    static ref DISPLAY_OVERRIDES: HashMap<&'static str, &'static str> = {
        let mut map = HashMap::new();
        map.insert("bmi", "BMI");
        map
    };
}

/// One patient row of the stroke dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokeRecord {
    pub id: i32,
    pub gender: String,
    pub age: f64,
    pub hypertension: i32,
    pub heart_disease: i32,
    pub ever_married: String,
    pub work_type: String,
    #[serde(rename = "Residence_type")]
    pub residence_type: String,
    pub avg_glucose_level: f64,
    #[serde(deserialize_with = "deserialize_bmi")]
    pub bmi: Option<f64>,
    pub smoking_status: String,
    pub stroke: i32,
}

fn deserialize_bmi<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let raw = raw.trim();
    if raw.is_empty() || raw == MISSING_BMI {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|e| serde::de::Error::custom(format!("bmi {raw:?}: {e}")))
}

pub fn hypertension_label(value: i32) -> &'static str {
    if value == 1 {
        "hypertensive"
    } else {
        "normotensive"
    }
}

pub fn heart_disease_label(value: i32) -> &'static str {
    if value == 1 {
        "heart_disease"
    } else {
        "no_heart_disease"
    }
}

impl StrokeRecord {
    pub fn raw_schema() -> Schema {
        Schema::from_iter(vec![
            Field::new("id", DataType::Int32),
            Field::new("gender", DataType::Utf8),
            Field::new("age", DataType::Float64),
            Field::new("hypertension", DataType::Int32),
            Field::new("heart_disease", DataType::Int32),
            Field::new("ever_married", DataType::Utf8),
            Field::new("work_type", DataType::Utf8),
            Field::new("Residence_type", DataType::Utf8),
            Field::new("avg_glucose_level", DataType::Float64),
            Field::new("bmi", DataType::Utf8),
            Field::new("smoking_status", DataType::Utf8),
            Field::new("stroke", DataType::Int32),
        ])
    }

    pub fn is_stroke(&self) -> bool {
        self.stroke == 1
    }

    /// Categorical view of a column. The 0/1 indicator columns come back as
    /// their descriptive labels; the target as `"0"`/`"1"`.
    pub fn category(&self, column: &str) -> Option<String> {
        let value = match column {
            "gender" => self.gender.clone(),
            "ever_married" => self.ever_married.clone(),
            "work_type" => self.work_type.clone(),
            "Residence_type" => self.residence_type.clone(),
            "smoking_status" => self.smoking_status.clone(),
            "hypertension" => hypertension_label(self.hypertension).to_string(),
            "heart_disease" => heart_disease_label(self.heart_disease).to_string(),
            "stroke" => self.stroke.to_string(),
            _ => return None,
        };
        Some(value)
    }

    pub fn numeric(&self, column: &str) -> Option<f64> {
        match column {
            "id" => Some(self.id as f64),
            "age" => Some(self.age),
            "avg_glucose_level" => Some(self.avg_glucose_level),
            "bmi" => self.bmi,
            "hypertension" => Some(self.hypertension as f64),
            "heart_disease" => Some(self.heart_disease as f64),
            "stroke" => Some(self.stroke as f64),
            _ => None,
        }
    }
}

/// Human readable column name for figure labels.
pub fn display_name(column: &str) -> String {
    if let Some(name) = DISPLAY_OVERRIDES.get(column) {
        return name.to_string();
    }
    column
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Which columns feed the models and how.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRoles {
    pub categorical: Vec<String>,
    pub numerical: Vec<String>,
    pub target: String,
}

impl ColumnRoles {
    /// String columns are categorical; so are numeric columns with fewer than
    /// three distinct values (0/1 indicators and the target).
    pub fn from_frame(df: &DataFrame) -> Result<Self> {
        let mut categorical = Vec::new();
        let mut low_cardinality = Vec::new();
        let mut numerical = Vec::new();

        for series in df.get_columns() {
            let name = series.name();
            if name == ID_COLUMN {
                continue;
            }
            if matches!(series.dtype(), DataType::Utf8) {
                categorical.push(name.to_string());
            } else if series.drop_nulls().n_unique()? < 3 {
                low_cardinality.push(name.to_string());
            } else {
                numerical.push(name.to_string());
            }
        }
        categorical.extend(low_cardinality);

        let before = categorical.len();
        categorical.retain(|name| name != TARGET_COLUMN);
        if categorical.len() == before {
            return Err(StrokeError::invalid(format!(
                "target column {TARGET_COLUMN:?} missing or not binary"
            )));
        }

        Ok(Self {
            categorical,
            numerical,
            target: TARGET_COLUMN.to_string(),
        })
    }

    pub fn categorical_with_target(&self) -> Vec<String> {
        let mut columns = self.categorical.clone();
        columns.push(self.target.clone());
        columns
    }
}

/// Silver cleaning of the raw frame: `bmi` text becomes Float64. The cast is
/// non-strict, so the `N/A` marker turns into null.
pub fn clean_silver(raw: DataFrame) -> PolarsResult<DataFrame> {
    raw.lazy()
        .with_column(col("bmi").cast(DataType::Float64))
        .collect()
}

pub fn records_to_dataframe(records: &[StrokeRecord]) -> PolarsResult<DataFrame> {
    DataFrame::new(vec![
        Series::new("id", records.iter().map(|r| r.id).collect::<Vec<i32>>()),
        Series::new("gender", records.iter().map(|r| r.gender.as_str()).collect::<Vec<&str>>()),
        Series::new("age", records.iter().map(|r| r.age).collect::<Vec<f64>>()),
        Series::new(
            "hypertension",
            records.iter().map(|r| r.hypertension).collect::<Vec<i32>>(),
        ),
        Series::new(
            "heart_disease",
            records.iter().map(|r| r.heart_disease).collect::<Vec<i32>>(),
        ),
        Series::new(
            "ever_married",
            records.iter().map(|r| r.ever_married.as_str()).collect::<Vec<&str>>(),
        ),
        Series::new(
            "work_type",
            records.iter().map(|r| r.work_type.as_str()).collect::<Vec<&str>>(),
        ),
        Series::new(
            "Residence_type",
            records.iter().map(|r| r.residence_type.as_str()).collect::<Vec<&str>>(),
        ),
        Series::new(
            "avg_glucose_level",
            records.iter().map(|r| r.avg_glucose_level).collect::<Vec<f64>>(),
        ),
        Series::new("bmi", records.iter().map(|r| r.bmi).collect::<Vec<Option<f64>>>()),
        Series::new(
            "smoking_status",
            records.iter().map(|r| r.smoking_status.as_str()).collect::<Vec<&str>>(),
        ),
        Series::new("stroke", records.iter().map(|r| r.stroke).collect::<Vec<i32>>()),
    ])
}

fn int_column(df: &DataFrame, name: &str) -> Result<Vec<Option<i32>>> {
    let series = df.column(name)?.cast(&DataType::Int32)?;
    let values = series.i32()?.into_iter().collect();
    Ok(values)
}

fn float_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let series = df.column(name)?.cast(&DataType::Float64)?;
    let values = series.f64()?.into_iter().collect();
    Ok(values)
}

fn text_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let series = df.column(name)?.cast(&DataType::Utf8)?;
    let values = series
        .utf8()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect();
    Ok(values)
}

fn required<T>(value: Option<T>, column: &str, row: usize) -> Result<T> {
    value.ok_or_else(|| StrokeError::invalid(format!("null {column} in row {row}")))
}

/// Rebuild typed records from a cleaned (silver) frame. Only `bmi` may be null.
pub fn records_from_dataframe(df: &DataFrame) -> Result<Vec<StrokeRecord>> {
    let ids = int_column(df, "id")?;
    let gender = text_column(df, "gender")?;
    let age = float_column(df, "age")?;
    let hypertension = int_column(df, "hypertension")?;
    let heart_disease = int_column(df, "heart_disease")?;
    let ever_married = text_column(df, "ever_married")?;
    let work_type = text_column(df, "work_type")?;
    let residence = text_column(df, "Residence_type")?;
    let glucose = float_column(df, "avg_glucose_level")?;
    let bmi = float_column(df, "bmi")?;
    let smoking = text_column(df, "smoking_status")?;
    let stroke = int_column(df, "stroke")?;

    let mut records = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        records.push(StrokeRecord {
            id: required(ids[row], "id", row)?,
            gender: required(gender[row].clone(), "gender", row)?,
            age: required(age[row], "age", row)?,
            hypertension: required(hypertension[row], "hypertension", row)?,
            heart_disease: required(heart_disease[row], "heart_disease", row)?,
            ever_married: required(ever_married[row].clone(), "ever_married", row)?,
            work_type: required(work_type[row].clone(), "work_type", row)?,
            residence_type: required(residence[row].clone(), "Residence_type", row)?,
            avg_glucose_level: required(glucose[row], "avg_glucose_level", row)?,
            bmi: bmi[row],
            smoking_status: required(smoking[row].clone(), "smoking_status", row)?,
            stroke: required(stroke[row], "stroke", row)?,
        });
    }
    Ok(records)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::StrokeRecord;

    pub const SAMPLE_CSV: &str = "\
id,gender,age,hypertension,heart_disease,ever_married,work_type,\
Residence_type,avg_glucose_level,bmi,smoking_status,stroke
9046,Male,67,0,1,Yes,Private,Urban,228.69,36.6,formerly smoked,1
51676,Female,61,0,0,Yes,Self-employed,Rural,202.21,N/A,never smoked,1
31112,Male,80,0,1,Yes,Private,Rural,105.92,32.5,never smoked,1
60182,Female,49,0,0,Yes,Private,Urban,171.23,34.4,smokes,0
1665,Female,79,1,0,Yes,Self-employed,Rural,174.12,24,never smoked,0
56669,Male,81,0,0,Yes,Private,Urban,186.21,29,formerly smoked,0
53882,Male,74,1,1,Yes,Private,Rural,70.09,27.4,never smoked,0
10434,Female,69,0,0,No,Private,Urban,94.39,22.8,never smoked,0
27419,Female,59,0,0,Yes,Private,Rural,76.15,N/A,Unknown,0
60491,Female,78,0,0,Yes,Private,Urban,58.57,24.2,Unknown,0
";

    /// Deterministic synthetic cohort where stroke tracks age and glucose.
    pub fn cohort(n: usize) -> Vec<StrokeRecord> {
        let genders = ["Male", "Female"];
        let work = ["Private", "Self-employed", "Govt_job", "children", "Never_worked"];
        let smoking = ["never smoked", "formerly smoked", "smokes", "Unknown"];
        (0..n)
            .map(|i| {
                let age = 1.0 + ((i * 37) % 82) as f64;
                let glucose = 60.0 + ((i * 53) % 180) as f64;
                let stroke = i32::from(age > 60.0 && glucose > 150.0);
                StrokeRecord {
                    id: i as i32,
                    gender: genders[i % 2].to_string(),
                    age,
                    hypertension: i32::from(i % 7 == 0),
                    heart_disease: i32::from(i % 11 == 0),
                    ever_married: if age > 25.0 { "Yes" } else { "No" }.to_string(),
                    work_type: work[i % work.len()].to_string(),
                    residence_type: if i % 3 == 0 { "Rural" } else { "Urban" }.to_string(),
                    avg_glucose_level: glucose,
                    bmi: if i % 13 == 0 { None } else { Some(18.0 + (i % 20) as f64) },
                    smoking_status: smoking[i % smoking.len()].to_string(),
                    stroke,
                }
            })
            .collect()
    }
}
