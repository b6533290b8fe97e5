use crate::error::Error;
use crate::fields::{FieldType, TypeTable};
use crate::parser::ParsedReport;
use datafusion::arrow::array::{
    Array, ArrayRef, AsArray, Float64Builder, Int64Builder, ListBuilder, RecordBatch,
    StringArray, StringBuilder,
};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use log::warn;
use std::sync::Arc;

/// Values platforms use for "nothing here".
const PLACEHOLDERS: [&str; 5] = ["", "-", "—", "N/A", "None"];

/// Label separators: comma, semicolon, ideographic and full-width comma, pipe.
const LIST_SEPARATORS: [char; 6] = [',', ';', '、', '，', '|', '｜'];

/// Builds a batch of nullable UTF-8 columns from parsed rows, in header order.
pub fn rows_to_batch(report: &ParsedReport) -> Result<RecordBatch, Error> {
    let schema = Arc::new(Schema::new(
        report
            .columns
            .iter()
            .map(|name| Field::new(name, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ));

    let columns: Vec<ArrayRef> = report
        .columns
        .iter()
        .map(|name| {
            let values: StringArray = report
                .rows
                .iter()
                .map(|row| row.get(name).map(String::as_str))
                .collect();
            Arc::new(values) as ArrayRef
        })
        .collect();

    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Casts every column that has an entry in `table`; other columns pass
/// through untouched. A column that fails to cast is logged and kept as-is.
pub fn cast(batch: &RecordBatch, table: &TypeTable) -> Result<RecordBatch, Error> {
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut columns = Vec::with_capacity(schema.fields().len());

    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        let cast = match table.lookup(field.name()) {
            Some(field_type) => match cast_column(column, field_type) {
                Ok(array) => Some(array),
                Err(err) => {
                    warn!(
                        "Failed to cast column {} to {:?}: {}",
                        field.name(),
                        field_type,
                        err
                    );
                    None
                }
            },
            None => None,
        };

        match cast {
            Some(array) => {
                fields.push(Field::new(field.name(), array.data_type().clone(), true));
                columns.push(array);
            }
            None => {
                fields.push(field.as_ref().clone());
                columns.push(column.clone());
            }
        }
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

fn cast_column(column: &ArrayRef, field_type: FieldType) -> Result<ArrayRef, Error> {
    let strings = column.as_string_opt::<i32>().ok_or_else(|| {
        Error::ReportParse(format!("expected a text column, found {}", column.data_type()))
    })?;

    let array: ArrayRef = match field_type {
        FieldType::Long => {
            let mut builder = Int64Builder::with_capacity(strings.len());
            for value in strings.iter() {
                builder.append_value(to_long(value)?);
            }
            Arc::new(builder.finish())
        }
        FieldType::Double => {
            let mut builder = Float64Builder::with_capacity(strings.len());
            for value in strings.iter() {
                builder.append_option(value.and_then(to_double));
            }
            Arc::new(builder.finish())
        }
        FieldType::Percent => {
            let mut builder = Float64Builder::with_capacity(strings.len());
            for value in strings.iter() {
                builder.append_option(value.and_then(to_ratio));
            }
            Arc::new(builder.finish())
        }
        FieldType::String | FieldType::Enum => column.clone(),
        FieldType::List => {
            let mut builder = ListBuilder::new(StringBuilder::new());
            for value in strings.iter() {
                for item in to_list(value) {
                    builder.values().append_value(item);
                }
                builder.append(true);
            }
            Arc::new(builder.finish())
        }
    };
    Ok(array)
}

fn clean_number(value: &str) -> String {
    value.trim().trim_end_matches('%').replace(',', "")
}

/// Missing or non-numeric values become 0; a fractional value fails the column.
fn to_long(value: Option<&str>) -> Result<i64, Error> {
    let Some(parsed) = value.and_then(|v| clean_number(v).parse::<f64>().ok()) else {
        return Ok(0);
    };
    if !parsed.is_finite() {
        return Ok(0);
    }
    if parsed.fract() != 0.0 {
        return Err(Error::ReportParse(format!("{} is not an integer", parsed)));
    }
    Ok(parsed as i64)
}

fn to_double(value: &str) -> Option<f64> {
    clean_number(value).parse::<f64>().ok()
}

fn to_ratio(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    if PLACEHOLDERS.contains(&trimmed) {
        return None;
    }
    let normalized = trimmed.trim_end_matches('%').trim().replace(',', ".");
    normalized.parse::<f64>().ok().map(|v| v / 100.0)
}

fn to_list(value: Option<&str>) -> Vec<String> {
    let Some(raw) = value.map(str::trim) else {
        return Vec::new();
    };
    if PLACEHOLDERS.contains(&raw) {
        return Vec::new();
    }

    if raw.starts_with('[') && raw.ends_with(']') {
        if let Ok(serde_json::Value::Array(items)) = serde_json::from_str::<serde_json::Value>(raw)
        {
            return items
                .into_iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => s.trim().to_string(),
                    other => other.to_string(),
                })
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    raw.split(LIST_SEPARATORS)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
