//!
//! Cursor Window
//!
//! A bounded, row-major buffer of query results. Space is accounted in bytes
//! against a fixed capacity: every allocated row costs a row slot plus one
//! field slot per column, and string/blob fields additionally cost their
//! payload (strings include a terminator byte). A write that would exceed
//! the capacity fails with `WindowError::Full` and leaves the window as it
//! was, which is what lets a filler stop at the last complete row.
//!
//! Typed getters convert between storage classes:
//!
//! | stored  | long            | double          | string         | blob        |
//! |---------|-----------------|-----------------|----------------|-------------|
//! | NULL    | 0               | 0.0             | None           | None        |
//! | INTEGER | value           | value as f64    | decimal text   | error       |
//! | FLOAT   | truncated       | value           | shortest text  | error       |
//! | STRING  | leading integer | leading number  | value          | UTF-8 bytes |
//! | BLOB    | error           | error           | error          | value       |
//!

use thiserror::Error;

pub const DEFAULT_WINDOW_SIZE: usize = 2 * 1024 * 1024;

const ROW_SLOT_SIZE: usize = 4;
const FIELD_SLOT_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("Cursor window is full")]
    Full,

    #[error("Couldn't read row {row}, col {column} from cursor window")]
    OutOfBounds { row: usize, column: usize },

    #[error("Invalid cursor window operation: {0}")]
    InvalidOperation(&'static str),

    #[error("Unable to convert {from:?} to {to}")]
    Conversion { from: FieldType, to: &'static str },
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Null = 0,
    Integer = 1,
    Float = 2,
    String = 3,
    Blob = 4,
}

#[derive(Debug, Clone, PartialEq)]
enum Field {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
}

impl Field {
    fn payload_size(&self) -> usize {
        match self {
            Field::String(s) => s.len() + 1,
            Field::Blob(b) => b.len(),
            _ => 0,
        }
    }

    fn field_type(&self) -> FieldType {
        match self {
            Field::Null => FieldType::Null,
            Field::Integer(_) => FieldType::Integer,
            Field::Float(_) => FieldType::Float,
            Field::String(_) => FieldType::String,
            Field::Blob(_) => FieldType::Blob,
        }
    }
}

#[derive(Debug)]
pub struct CursorWindow {
    name: String,
    capacity: usize,
    used: usize,
    num_columns: usize,
    start_position: i32,
    rows: Vec<Vec<Field>>,
}

impl CursorWindow {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            used: 0,
            num_columns: 0,
            start_position: 0,
            rows: Vec::new(),
        }
    }

    pub fn with_default_size(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_WINDOW_SIZE)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_space(&self) -> usize {
        self.capacity - self.used
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    pub fn start_position(&self) -> i32 {
        self.start_position
    }

    pub fn set_start_position(&mut self, position: i32) {
        self.start_position = position;
    }

    /// Drop every row and forget the column count.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.used = 0;
        self.num_columns = 0;
    }

    /// Fix the column count. Changing it once rows exist is refused.
    pub fn set_num_columns(&mut self, num_columns: usize) -> Result<(), WindowError> {
        if !self.rows.is_empty() && num_columns != self.num_columns {
            return Err(WindowError::InvalidOperation(
                "column count cannot change while rows are allocated",
            ));
        }
        self.num_columns = num_columns;
        Ok(())
    }

    fn reserve(&mut self, bytes: usize) -> Result<(), WindowError> {
        if bytes > self.free_space() {
            return Err(WindowError::Full);
        }
        self.used += bytes;
        Ok(())
    }

    /// Append a row of NULL fields.
    pub fn alloc_row(&mut self) -> Result<(), WindowError> {
        self.reserve(ROW_SLOT_SIZE + self.num_columns * FIELD_SLOT_SIZE)?;
        self.rows.push(vec![Field::Null; self.num_columns]);
        Ok(())
    }

    pub fn free_last_row(&mut self) -> Result<(), WindowError> {
        let row = self
            .rows
            .pop()
            .ok_or(WindowError::InvalidOperation("no row to free"))?;
        let payload: usize = row.iter().map(Field::payload_size).sum();
        self.used -= ROW_SLOT_SIZE + self.num_columns * FIELD_SLOT_SIZE + payload;
        Ok(())
    }

    fn field(&self, row: usize, column: usize) -> Result<&Field, WindowError> {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .ok_or(WindowError::OutOfBounds { row, column })
    }

    fn put(&mut self, row: usize, column: usize, value: Field) -> Result<(), WindowError> {
        let old_size = self.field(row, column)?.payload_size();
        let new_size = value.payload_size();
        if new_size > old_size {
            self.reserve(new_size - old_size)?;
        } else {
            self.used -= old_size - new_size;
        }
        self.rows[row][column] = value;
        Ok(())
    }

    pub fn put_null(&mut self, row: usize, column: usize) -> Result<(), WindowError> {
        self.put(row, column, Field::Null)
    }

    pub fn put_long(&mut self, row: usize, column: usize, value: i64) -> Result<(), WindowError> {
        self.put(row, column, Field::Integer(value))
    }

    pub fn put_double(&mut self, row: usize, column: usize, value: f64) -> Result<(), WindowError> {
        self.put(row, column, Field::Float(value))
    }

    pub fn put_string(&mut self, row: usize, column: usize, value: &str) -> Result<(), WindowError> {
        self.put(row, column, Field::String(value.to_string()))
    }

    pub fn put_blob(&mut self, row: usize, column: usize, value: &[u8]) -> Result<(), WindowError> {
        self.put(row, column, Field::Blob(value.to_vec()))
    }

    pub fn get_type(&self, row: usize, column: usize) -> Result<FieldType, WindowError> {
        Ok(self.field(row, column)?.field_type())
    }

    pub fn get_long(&self, row: usize, column: usize) -> Result<i64, WindowError> {
        match self.field(row, column)? {
            Field::Null => Ok(0),
            Field::Integer(v) => Ok(*v),
            Field::Float(v) => Ok(*v as i64),
            Field::String(s) => Ok(leading_integer(s)),
            Field::Blob(_) => Err(WindowError::Conversion {
                from: FieldType::Blob,
                to: "long",
            }),
        }
    }

    pub fn get_double(&self, row: usize, column: usize) -> Result<f64, WindowError> {
        match self.field(row, column)? {
            Field::Null => Ok(0.0),
            Field::Integer(v) => Ok(*v as f64),
            Field::Float(v) => Ok(*v),
            Field::String(s) => Ok(leading_float(s)),
            Field::Blob(_) => Err(WindowError::Conversion {
                from: FieldType::Blob,
                to: "double",
            }),
        }
    }

    pub fn get_string(&self, row: usize, column: usize) -> Result<Option<String>, WindowError> {
        match self.field(row, column)? {
            Field::Null => Ok(None),
            Field::Integer(v) => Ok(Some(v.to_string())),
            Field::Float(v) => Ok(Some(v.to_string())),
            Field::String(s) => Ok(Some(s.clone())),
            Field::Blob(_) => Err(WindowError::Conversion {
                from: FieldType::Blob,
                to: "string",
            }),
        }
    }

    pub fn get_blob(&self, row: usize, column: usize) -> Result<Option<Vec<u8>>, WindowError> {
        match self.field(row, column)? {
            Field::Null => Ok(None),
            Field::Blob(b) => Ok(Some(b.clone())),
            Field::String(s) => Ok(Some(s.as_bytes().to_vec())),
            other => Err(WindowError::Conversion {
                from: other.field_type(),
                to: "blob",
            }),
        }
    }
}

/// Parse the longest integer prefix, the way `strtoll` does; 0 if none.
/// Out-of-range values saturate.
fn leading_integer(s: &str) -> i64 {
    let trimmed = s.trim_start();
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    let digits = count_digits(&bytes[end..]);
    if digits == 0 {
        return 0;
    }
    end += digits;
    trimmed[..end].parse().unwrap_or(if bytes[0] == b'-' { i64::MIN } else { i64::MAX })
}

fn count_digits(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}

/// Parse the longest floating point prefix, the way `strtod` does; 0.0 if
/// none. The prefix is found in one pass and parsed once:
///
/// ```text
/// [+-] ( digits [. digits] | . digits ) [ (e|E) [+-] digits ]
/// [+-] ( inf | infinity | nan )
/// ```
fn leading_float(s: &str) -> f64 {
    let trimmed = s.trim_start();
    let bytes = trimmed.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }

    let whole = count_digits(&bytes[end..]);
    end += whole;
    let mut fraction = 0;
    if bytes.get(end) == Some(&b'.') {
        fraction = count_digits(&bytes[end + 1..]);
        if whole + fraction > 0 {
            end += 1 + fraction;
        }
    }

    if whole + fraction == 0 {
        let rest = &trimmed[end..];
        return ["infinity", "inf", "nan"]
            .iter()
            .find(|word| rest.get(..word.len()).is_some_and(|p| p.eq_ignore_ascii_case(word)))
            .and_then(|word| trimmed[..end + word.len()].parse().ok())
            .unwrap_or(0.0);
    }

    if matches!(bytes.get(end), Some(b'e') | Some(b'E')) {
        let mut exponent = end + 1;
        if matches!(bytes.get(exponent), Some(b'+') | Some(b'-')) {
            exponent += 1;
        }
        let digits = count_digits(&bytes[exponent..]);
        if digits > 0 {
            end = exponent + digits;
        }
    }
    trimmed[..end].parse().unwrap_or(0.0)
}
