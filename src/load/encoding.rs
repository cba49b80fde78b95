//! ARCHIVIST - Row & Descriptor Encoding
//! Maps loaded schemas and rows onto store keys and values.
//!
//! ## Key layout
//! ```text
//! descriptor: [0x02][id: 4 BE]
//! row:        [0x10][table id: 4 BE][primary key columns...]
//! ```
//! Primary key columns use an order-preserving encoding so byte order of
//! keys matches value order of the key columns:
//! - INT:    8 bytes BE with the sign bit flipped
//! - FLOAT:  8 bytes BE of the IEEE bits, sign-adjusted
//! - BOOL:   one byte, 0 or 1
//! - STRING/BYTES: 0x00 escaped as 0x00 0xFF, terminated by 0x00 0x01
//!
//! Values are bincode: a [`Descriptor`] or the row's full datum vector.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Key, KeySpan};

use super::statement::{ColumnDef, ColumnType, Literal};

pub const DESCRIPTOR_PREFIX: u8 = 0x02;
pub const ROW_PREFIX: u8 = 0x10;

/// A typed column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Bool(bool),
}

impl Datum {
    /// Convert a literal into a value of column type `ty`.
    pub fn coerce(literal: &Literal, ty: ColumnType) -> std::result::Result<Datum, String> {
        match (literal, ty) {
            (Literal::Null, _) => Ok(Datum::Null),
            (Literal::Int(i), ColumnType::Int) => Ok(Datum::Int(*i)),
            (Literal::Int(i), ColumnType::Float) => Ok(Datum::Float(*i as f64)),
            (Literal::Float(f), ColumnType::Float) => Ok(Datum::Float(*f)),
            (Literal::Str(s), ColumnType::String) => Ok(Datum::String(s.clone())),
            (Literal::Str(s), ColumnType::Bytes) => Ok(Datum::Bytes(s.as_bytes().to_vec())),
            (Literal::Bool(b), ColumnType::Bool) => Ok(Datum::Bool(*b)),
            (literal, ty) => Err(format!("cannot use {:?} as a {:?} value", literal, ty)),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }
}

/// A table schema as recorded in the descriptor key space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: u32,
    pub database_id: u32,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Indexes into `columns`, in key order.
    pub primary_key: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Descriptor {
    Database { id: u32, name: String },
    Table(TableSchema),
}

impl Descriptor {
    pub fn id(&self) -> u32 {
        match self {
            Descriptor::Database { id, .. } => *id,
            Descriptor::Table(schema) => schema.id,
        }
    }
}

pub fn descriptor_key(id: u32) -> Key {
    let mut key = Vec::with_capacity(5);
    key.push(DESCRIPTOR_PREFIX);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Key span holding every descriptor.
pub fn descriptor_span() -> KeySpan {
    KeySpan::new(vec![DESCRIPTOR_PREFIX], vec![DESCRIPTOR_PREFIX + 1])
}

pub fn encode_descriptor(desc: &Descriptor) -> Result<Vec<u8>> {
    Ok(bincode::serialize(desc)?)
}

pub fn decode_descriptor(bytes: &[u8]) -> Result<Descriptor> {
    Ok(bincode::deserialize(bytes)?)
}

fn table_prefix(table_id: u32) -> Key {
    let mut key = Vec::with_capacity(16);
    key.push(ROW_PREFIX);
    key.extend_from_slice(&table_id.to_be_bytes());
    key
}

/// Key span holding every row of a table.
pub fn table_span(table_id: u32) -> KeySpan {
    let end = match table_id.checked_add(1) {
        Some(next) => table_prefix(next),
        None => vec![ROW_PREFIX + 1],
    };
    KeySpan::new(table_prefix(table_id), end)
}

fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        out.push(b);
        if b == 0x00 {
            out.push(0xff);
        }
    }
    out.extend_from_slice(&[0x00, 0x01]);
}

fn encode_key_datum(out: &mut Vec<u8>, datum: &Datum) {
    match datum {
        // The loader rejects NULL key columns before encoding.
        Datum::Null => out.push(0x00),
        Datum::Int(i) => out.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes()),
        Datum::Float(f) => {
            let bits = f.to_bits();
            let ordered = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
            out.extend_from_slice(&ordered.to_be_bytes());
        }
        Datum::Bool(b) => out.push(u8::from(*b)),
        Datum::String(s) => encode_bytes(out, s.as_bytes()),
        Datum::Bytes(b) => encode_bytes(out, b),
    }
}

/// Key of a row: table prefix followed by the encoded primary key columns.
pub fn row_key(schema: &TableSchema, row: &[Datum]) -> Key {
    let mut key = table_prefix(schema.id);
    for &idx in &schema.primary_key {
        encode_key_datum(&mut key, &row[idx]);
    }
    key
}

pub fn encode_row(row: &[Datum]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(row)?)
}

pub fn decode_row(bytes: &[u8]) -> Result<Vec<Datum>> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(types: &[ColumnType], pk: Vec<usize>) -> TableSchema {
        TableSchema {
            id: 100,
            database_id: 50,
            name: "t".into(),
            columns: types
                .iter()
                .enumerate()
                .map(|(i, ty)| ColumnDef {
                    name: format!("c{}", i),
                    ty: *ty,
                    nullable: false,
                })
                .collect(),
            primary_key: pk,
        }
    }

    #[test]
    fn test_int_keys_sort_numerically() {
        let s = schema(&[ColumnType::Int], vec![0]);
        let keys: Vec<Key> = [-5i64, -1, 0, 3, i64::MAX]
            .iter()
            .map(|i| row_key(&s, &[Datum::Int(*i)]))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_float_keys_sort_numerically() {
        let s = schema(&[ColumnType::Float], vec![0]);
        let keys: Vec<Key> = [-2.5f64, -0.1, 0.0, 0.5, 1e9]
            .iter()
            .map(|f| row_key(&s, &[Datum::Float(*f)]))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_string_keys_are_prefix_free() {
        let s = schema(&[ColumnType::String, ColumnType::Int], vec![0, 1]);
        let a = row_key(&s, &[Datum::String("a".into()), Datum::Int(9)]);
        let ab = row_key(&s, &[Datum::String("ab".into()), Datum::Int(0)]);
        let nul = row_key(&s, &[Datum::String("a\0".into()), Datum::Int(0)]);
        assert!(a < nul && nul < ab);
    }

    #[test]
    fn test_rows_stay_inside_table_span() {
        let s = schema(&[ColumnType::Int], vec![0]);
        let span = table_span(s.id);
        assert!(span.contains(&row_key(&s, &[Datum::Int(i64::MIN)])));
        assert!(span.contains(&row_key(&s, &[Datum::Int(i64::MAX)])));
        assert!(!descriptor_span().overlaps(&span));
        assert!(descriptor_span().contains(&descriptor_key(7)));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(Datum::coerce(&Literal::Int(2), ColumnType::Float), Ok(Datum::Float(2.0)));
        assert_eq!(
            Datum::coerce(&Literal::Str("x".into()), ColumnType::Bytes),
            Ok(Datum::Bytes(b"x".to_vec()))
        );
        assert!(Datum::coerce(&Literal::Str("x".into()), ColumnType::Int).is_err());
    }

    #[test]
    fn test_values_decode() {
        let row = vec![Datum::Int(1), Datum::Null, Datum::String("p".into())];
        assert_eq!(decode_row(&encode_row(&row).unwrap()).unwrap(), row);
        let desc = Descriptor::Database {
            id: 50,
            name: "bench".into(),
        };
        assert_eq!(decode_descriptor(&encode_descriptor(&desc).unwrap()).unwrap(), desc);
    }
}
