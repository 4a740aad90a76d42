// Copyright 2025 Stoolap Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Core type definitions
//!
//! [`DataType`] names the logical SQL type, [`ColumnType`] adds nullability and
//! the string dictionary binding. Inline null sentinels and empty-entry keys
//! used inside result buffers live here as well.

use std::fmt;

/// SQL data types understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DataType {
    /// NULL literal type, replaced by BIGINT when materialized
    #[default]
    Null = 0,
    Boolean = 1,
    TinyInt = 2,
    SmallInt = 3,
    Integer = 4,
    BigInt = 5,
    /// Fixed point, stored as a scaled BIGINT
    Decimal = 6,
    Float = 7,
    Double = 8,
    /// Days since epoch
    Date = 9,
    /// Microseconds since epoch
    Timestamp = 10,
    /// None-encoded variable length text
    Text = 11,
    /// Dictionary-encoded text, stored as a 32-bit id
    DictText = 12,
    Array = 13,
}

impl DataType {
    /// Canonical storage width in bytes, 0 for variable length types
    pub fn size(&self) -> usize {
        match self {
            DataType::Null => 0,
            DataType::Boolean | DataType::TinyInt => 1,
            DataType::SmallInt => 2,
            DataType::Integer | DataType::Float | DataType::DictText => 4,
            DataType::BigInt
            | DataType::Decimal
            | DataType::Double
            | DataType::Date
            | DataType::Timestamp => 8,
            DataType::Text | DataType::Array => 0,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::TinyInt | DataType::SmallInt | DataType::Integer | DataType::BigInt
        )
    }

    pub fn is_decimal(&self) -> bool {
        matches!(self, DataType::Decimal)
    }

    pub fn is_fp(&self) -> bool {
        matches!(self, DataType::Float | DataType::Double)
    }

    /// Integer, decimal or floating point
    pub fn is_number(&self) -> bool {
        self.is_integer() || self.is_decimal() || self.is_fp()
    }

    pub fn is_string(&self) -> bool {
        matches!(self, DataType::Text | DataType::DictText)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, DataType::Array)
    }

    /// Returns the type ID as u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Null => "NULL",
            DataType::Boolean => "BOOLEAN",
            DataType::TinyInt => "TINYINT",
            DataType::SmallInt => "SMALLINT",
            DataType::Integer => "INTEGER",
            DataType::BigInt => "BIGINT",
            DataType::Decimal => "DECIMAL",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
            DataType::Date => "DATE",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Text => "TEXT",
            DataType::DictText => "TEXT ENCODING DICT",
            DataType::Array => "ARRAY",
        };
        write!(f, "{}", name)
    }
}

/// A column type: logical type plus nullability and dictionary binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ColumnType {
    pub data_type: DataType,
    pub nullable: bool,
    /// Dictionary id for [`DataType::DictText`] columns
    pub dict_id: Option<i32>,
}

impl ColumnType {
    pub const fn new(data_type: DataType, nullable: bool) -> Self {
        Self {
            data_type,
            nullable,
            dict_id: None,
        }
    }

    /// Nullable column of the given type
    pub const fn nullable(data_type: DataType) -> Self {
        Self::new(data_type, true)
    }

    /// NOT NULL column of the given type
    pub const fn not_null(data_type: DataType) -> Self {
        Self::new(data_type, false)
    }

    /// Nullable dictionary-encoded text column
    pub const fn dict_text(dict_id: i32) -> Self {
        Self {
            data_type: DataType::DictText,
            nullable: true,
            dict_id: Some(dict_id),
        }
    }

    pub fn bigint() -> Self {
        Self::nullable(DataType::BigInt)
    }

    pub fn double() -> Self {
        Self::nullable(DataType::Double)
    }

    pub fn size(&self) -> usize {
        self.data_type.size()
    }

    pub fn is_fp32(&self) -> bool {
        self.data_type == DataType::Float
    }

    pub fn is_number(&self) -> bool {
        self.data_type.is_number()
    }

    pub fn is_string(&self) -> bool {
        self.data_type.is_string()
    }

    pub fn is_array(&self) -> bool {
        self.data_type.is_array()
    }

    pub fn is_dict_encoded(&self) -> bool {
        self.data_type == DataType::DictText
    }

    /// Types without a fixed-width inline representation
    pub fn is_varlen(&self) -> bool {
        matches!(self.data_type, DataType::Text | DataType::Array)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.data_type)?;
        if !self.nullable {
            write!(f, " NOT NULL")?;
        }
        Ok(())
    }
}

/// Target device for a compiled kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutorDeviceType {
    #[default]
    Cpu,
    Gpu,
}

impl fmt::Display for ExecutorDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorDeviceType::Cpu => write!(f, "CPU"),
            ExecutorDeviceType::Gpu => write!(f, "GPU"),
        }
    }
}

// =============================================================================
// Inline sentinels
// =============================================================================

pub const NULL_TINYINT: i64 = i8::MIN as i64;
pub const NULL_SMALLINT: i64 = i16::MIN as i64;
pub const NULL_INT: i64 = i32::MIN as i64;
pub const NULL_BIGINT: i64 = i64::MIN;
pub const NULL_FLOAT: f32 = f32::MIN;
pub const NULL_DOUBLE: f64 = f64::MIN;

pub const EMPTY_KEY_8: i64 = i8::MAX as i64;
pub const EMPTY_KEY_16: i64 = i16::MAX as i64;
pub const EMPTY_KEY_32: i64 = i32::MAX as i64;
pub const EMPTY_KEY_64: i64 = i64::MAX;

/// Inline NULL for a signed integer slot of `width` bytes
pub fn inline_int_null(width: usize) -> i64 {
    match width {
        1 => NULL_TINYINT,
        2 => NULL_SMALLINT,
        4 => NULL_INT,
        _ => NULL_BIGINT,
    }
}

/// Marker stored in the first key (or slot) of an unused buffer entry
pub fn empty_key(width: usize) -> i64 {
    match width {
        1 => EMPTY_KEY_8,
        2 => EMPTY_KEY_16,
        4 => EMPTY_KEY_32,
        _ => EMPTY_KEY_64,
    }
}
