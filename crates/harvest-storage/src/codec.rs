use std::sync::Arc;

use arrow_array::{
    Array, Int32Array, RecordBatch, StringArray, TimestampMicrosecondArray, UInt32Array,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use harvest_core::{columns, NormalizedRecord};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::StorageError;

fn utc_micros() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

pub fn record_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(columns::CATEGORY, DataType::Utf8, false),
        Field::new(columns::TAG, DataType::Utf8, false),
        Field::new(columns::USERNAME, DataType::Utf8, false),
        Field::new(columns::TWEET_TEXT, DataType::Utf8, false),
        Field::new(columns::POST_TIME_RAW, utc_micros(), false),
        Field::new(columns::SCRAPE_TIME, utc_micros(), false),
        Field::new(columns::YEAR, DataType::Int32, false),
        Field::new(columns::MONTH, DataType::UInt32, false),
        Field::new(columns::DAY, DataType::UInt32, false),
    ]))
}

fn to_record_batch(records: &[&NormalizedRecord]) -> Result<RecordBatch, StorageError> {
    let strings = |f: fn(&NormalizedRecord) -> &str| {
        StringArray::from(records.iter().map(|r| Some(f(*r))).collect::<Vec<_>>())
    };
    let post_times = TimestampMicrosecondArray::from(
        records
            .iter()
            .map(|r| r.post_time_raw.timestamp_micros())
            .collect::<Vec<_>>(),
    )
    .with_timezone("UTC");
    let scrape_times = TimestampMicrosecondArray::from(
        records
            .iter()
            .map(|r| r.scrape_time.timestamp_micros())
            .collect::<Vec<_>>(),
    )
    .with_timezone("UTC");

    let batch = RecordBatch::try_new(
        record_schema(),
        vec![
            Arc::new(strings(|r| r.category.as_str())),
            Arc::new(strings(|r| r.tag.as_str())),
            Arc::new(strings(|r| r.username.as_str())),
            Arc::new(strings(|r| r.tweet_text.as_str())),
            Arc::new(post_times),
            Arc::new(scrape_times),
            Arc::new(Int32Array::from(records.iter().map(|r| r.year).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(records.iter().map(|r| r.month).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(records.iter().map(|r| r.day).collect::<Vec<_>>())),
        ],
    )?;
    Ok(batch)
}

/// Encode records as one parquet file held in memory.
pub fn encode_parquet(records: &[&NormalizedRecord]) -> Result<Vec<u8>, StorageError> {
    let batch = to_record_batch(records)?;
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)?;
    writer.write(&batch)?;
    Ok(writer.into_inner()?)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, StorageError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| StorageError::Schema(format!("column {name} is missing or mistyped")))
}

fn timestamp_at(
    array: &TimestampMicrosecondArray,
    name: &str,
    row: usize,
) -> Result<DateTime<Utc>, StorageError> {
    if array.is_null(row) {
        return Err(StorageError::Schema(format!("null {name} at row {row}")));
    }
    DateTime::from_timestamp_micros(array.value(row))
        .ok_or_else(|| StorageError::Schema(format!("{name} out of range at row {row}")))
}

fn string_at(array: &StringArray, name: &str, row: usize) -> Result<String, StorageError> {
    if array.is_null(row) {
        return Err(StorageError::Schema(format!("null {name} at row {row}")));
    }
    Ok(array.value(row).to_string())
}

fn decode_batch(batch: &RecordBatch, out: &mut Vec<NormalizedRecord>) -> Result<(), StorageError> {
    let category = column::<StringArray>(batch, columns::CATEGORY)?;
    let tag = column::<StringArray>(batch, columns::TAG)?;
    let username = column::<StringArray>(batch, columns::USERNAME)?;
    let tweet_text = column::<StringArray>(batch, columns::TWEET_TEXT)?;
    let post_time = column::<TimestampMicrosecondArray>(batch, columns::POST_TIME_RAW)?;
    let scrape_time = column::<TimestampMicrosecondArray>(batch, columns::SCRAPE_TIME)?;
    let year = column::<Int32Array>(batch, columns::YEAR)?;
    let month = column::<UInt32Array>(batch, columns::MONTH)?;
    let day = column::<UInt32Array>(batch, columns::DAY)?;

    out.reserve(batch.num_rows());
    for row in 0..batch.num_rows() {
        out.push(NormalizedRecord {
            category: string_at(category, columns::CATEGORY, row)?,
            tag: string_at(tag, columns::TAG, row)?,
            username: string_at(username, columns::USERNAME, row)?,
            tweet_text: string_at(tweet_text, columns::TWEET_TEXT, row)?,
            post_time_raw: timestamp_at(post_time, columns::POST_TIME_RAW, row)?,
            scrape_time: timestamp_at(scrape_time, columns::SCRAPE_TIME, row)?,
            year: year.value(row),
            month: month.value(row),
            day: day.value(row),
        });
    }
    Ok(())
}

pub fn decode_parquet(bytes: Vec<u8>) -> Result<Vec<NormalizedRecord>, StorageError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))?.build()?;
    let mut records = Vec::new();
    for batch in reader {
        decode_batch(&batch?, &mut records)?;
    }
    Ok(records)
}
