use crate::config::ArtifactFormat;
use crate::dataset::{Column, ColumnType, ColumnValues, Dataset};
use anyhow::{Context, Result, anyhow};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

const UTC: &str = "UTC";

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::String => DataType::Utf8,
        ColumnType::Bool => DataType::Boolean,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into())),
    }
}

/// Maps artifacts written by other tools onto the closest column type.
fn column_type_for(data_type: &DataType) -> Option<ColumnType> {
    match data_type {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => Some(ColumnType::Int64),
        DataType::Float32 | DataType::Float64 => Some(ColumnType::Float64),
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => Some(ColumnType::String),
        DataType::Boolean => Some(ColumnType::Bool),
        DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => {
            Some(ColumnType::Timestamp)
        }
        _ => None,
    }
}

fn to_array(values: &ColumnValues) -> ArrayRef {
    match values {
        ColumnValues::Int64(v) => Arc::new(Int64Array::from(v.clone())),
        ColumnValues::Float64(v) => Arc::new(Float64Array::from(v.clone())),
        ColumnValues::String(v) => Arc::new(StringArray::from(v.clone())),
        ColumnValues::Bool(v) => Arc::new(BooleanArray::from(v.clone())),
        ColumnValues::Timestamp(v) => Arc::new(
            TimestampMicrosecondArray::from(
                v.iter()
                    .map(|ts| ts.map(|ts| ts.timestamp_micros()))
                    .collect::<Vec<_>>(),
            )
            .with_timezone(UTC),
        ),
    }
}

pub(crate) fn to_record_batch(dataset: &Dataset) -> Result<RecordBatch> {
    let fields: Vec<Field> = dataset
        .columns()
        .iter()
        .map(|c| Field::new(c.name.as_str(), arrow_type(c.column_type()), true))
        .collect();
    let arrays: Vec<ArrayRef> = dataset.columns().iter().map(|c| to_array(&c.values)).collect();
    let options = RecordBatchOptions::new().with_row_count(Some(dataset.row_count()));
    RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), arrays, &options)
        .context("Failed to build record batch from dataset")
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, column: &str) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("Unexpected array layout for column '{}'", column))
}

fn append(values: &mut ColumnValues, array: &ArrayRef, column: &str) -> Result<()> {
    let target = arrow_type(values.column_type());
    let array = cast(array, &target)
        .with_context(|| format!("Failed to cast column '{}' to {}", column, target))?;
    match values {
        ColumnValues::Int64(v) => v.extend(downcast::<Int64Array>(&array, column)?.iter()),
        ColumnValues::Float64(v) => v.extend(downcast::<Float64Array>(&array, column)?.iter()),
        ColumnValues::String(v) => v.extend(
            downcast::<StringArray>(&array, column)?
                .iter()
                .map(|s| s.map(str::to_owned)),
        ),
        ColumnValues::Bool(v) => v.extend(downcast::<BooleanArray>(&array, column)?.iter()),
        ColumnValues::Timestamp(v) => {
            for micros in downcast::<TimestampMicrosecondArray>(&array, column)?.iter() {
                let ts = micros
                    .map(|m| {
                        DateTime::<Utc>::from_timestamp_micros(m)
                            .ok_or_else(|| anyhow!("Timestamp out of range in column '{}'", column))
                    })
                    .transpose()?;
                v.push(ts);
            }
        }
    }
    Ok(())
}

pub(crate) fn from_record_batches(schema: SchemaRef, batches: &[RecordBatch]) -> Result<Dataset> {
    let mut columns = Vec::with_capacity(schema.fields().len());
    for (index, field) in schema.fields().iter().enumerate() {
        let column_type = column_type_for(field.data_type()).ok_or_else(|| {
            anyhow!(
                "Unsupported data type {} for column '{}'",
                field.data_type(),
                field.name()
            )
        })?;
        let mut values = match column_type {
            ColumnType::Int64 => ColumnValues::Int64(Vec::new()),
            ColumnType::Float64 => ColumnValues::Float64(Vec::new()),
            ColumnType::String => ColumnValues::String(Vec::new()),
            ColumnType::Bool => ColumnValues::Bool(Vec::new()),
            ColumnType::Timestamp => ColumnValues::Timestamp(Vec::new()),
        };
        for batch in batches {
            append(&mut values, batch.column(index), field.name())?;
        }
        columns.push(Column::new(field.name().as_str(), values));
    }
    Dataset::try_new(columns)
}

/// Writes `batch` to `file` and fsyncs it.
pub(crate) fn write_file(batch: &RecordBatch, file: File, format: ArtifactFormat) -> Result<()> {
    match format {
        ArtifactFormat::Parquet => {
            let mut writer = ArrowWriter::try_new(file.try_clone()?, batch.schema(), None)?;
            writer.write(batch)?;
            writer.close()?;
        }
        ArtifactFormat::ArrowIpc => {
            let mut writer = FileWriter::try_new(file.try_clone()?, batch.schema().as_ref())?;
            writer.write(batch)?;
            writer.finish()?;
        }
    }
    file.sync_all()?;
    Ok(())
}

pub(crate) fn read_file(path: &Path, format: ArtifactFormat) -> Result<Dataset> {
    let file = File::open(path)?;
    let (schema, batches) = match format {
        ArtifactFormat::Parquet => {
            let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
            let schema = builder.schema().clone();
            let batches = builder
                .build()?
                .collect::<std::result::Result<Vec<_>, ArrowError>>()?;
            (schema, batches)
        }
        ArtifactFormat::ArrowIpc => {
            let reader = FileReader::try_new(file, None)?;
            let schema = reader.schema();
            let batches = reader.collect::<std::result::Result<Vec<_>, ArrowError>>()?;
            (schema, batches)
        }
    };
    from_record_batches(schema, &batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use chrono::TimeZone;

    fn sample() -> Result<Dataset> {
        Dataset::try_new(vec![
            Column::new("user_id", ColumnValues::Int64(vec![Some(1), Some(2)])),
            Column::new("ratio", ColumnValues::Float64(vec![Some(0.5), None])),
            Column::new(
                "country",
                ColumnValues::String(vec![None, Some("DE".to_string())]),
            ),
            Column::new("active", ColumnValues::Bool(vec![Some(false), Some(true)])),
            Column::new(
                "seen_at",
                ColumnValues::Timestamp(vec![
                    Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
                    None,
                ]),
            ),
        ])
    }

    #[test]
    fn record_batch_keeps_schema_and_rows() -> Result<()> {
        let dataset = sample()?;
        let batch = to_record_batch(&dataset)?;
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 5);
        assert_eq!(batch.schema().field(0).data_type(), &DataType::Int64);
        let back = from_record_batches(batch.schema(), &[batch])?;
        assert_eq!(back, dataset);
        Ok(())
    }

    #[test]
    fn zero_row_dataset_converts() -> Result<()> {
        let dataset = Dataset::try_new(vec![Column::new("id", ColumnValues::Int64(vec![]))])?;
        let batch = to_record_batch(&dataset)?;
        assert_eq!(batch.num_rows(), 0);
        let back = from_record_batches(batch.schema(), &[])?;
        assert_eq!(back.row_count(), 0);
        assert_eq!(back.columns()[0].column_type(), ColumnType::Int64);
        Ok(())
    }

    #[test]
    fn narrower_integers_widen_to_int64() -> Result<()> {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int32, true)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int32Array::from(vec![Some(7), None]))],
        )?;
        let dataset = from_record_batches(schema, &[batch])?;
        assert_eq!(
            dataset.columns()[0].values,
            ColumnValues::Int64(vec![Some(7), None])
        );
        Ok(())
    }

    #[test]
    fn batches_are_concatenated_in_order() -> Result<()> {
        let dataset = sample()?;
        let batch = to_record_batch(&dataset)?;
        let back = from_record_batches(batch.schema(), &[batch.clone(), batch])?;
        assert_eq!(back.row_count(), 4);
        assert_eq!(
            back.column("user_id").map(|c| c.values.clone()),
            Some(ColumnValues::Int64(vec![Some(1), Some(2), Some(1), Some(2)]))
        );
        Ok(())
    }
}
