//! The in-memory message model and its conversion to/from the legacy flat
//! wire form.
//!
//! A [`Message`] carries a `command`, an ordered list of `common` key/value
//! pairs, and a `data` table of named columns. The flat form join/split
//! rules mirror the original coserver wire format byte for byte: see
//! [`Message::to_flat`] and [`Message::from_flat`].

/// Separator used to join/split fields in the legacy flat form.
const SEP: char = ':';

/// A structured coserver message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    command: String,
    common_desc: Vec<String>,
    common_values: Vec<String>,
    data_desc: Vec<String>,
    data_rows: Vec<Vec<String>>,
}

impl Message {
    /// Creates a new message with the given command and no common/data
    /// entries.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Appends a `(desc, value)` pair to the common list.
    pub fn add_common(&mut self, desc: impl Into<String>, value: impl Into<String>) {
        self.common_desc.push(desc.into());
        self.common_values.push(value.into());
    }

    /// Returns the value for the first common entry whose description
    /// matches `desc`, or an empty string if none matches.
    #[must_use]
    pub fn common_value(&self, desc: &str) -> &str {
        self.common_desc
            .iter()
            .position(|d| d == desc)
            .map_or("", |i| self.common_values[i].as_str())
    }

    #[must_use]
    pub fn common_desc(&self) -> &[String] {
        &self.common_desc
    }

    #[must_use]
    pub fn common_values(&self) -> &[String] {
        &self.common_values
    }

    /// Appends a data column description. Permitted only while the data
    /// table has zero rows; returns `false` (silent reject, per the
    /// original's behavior) otherwise.
    pub fn add_data_desc(&mut self, desc: impl Into<String>) -> bool {
        if !self.data_rows.is_empty() {
            return false;
        }
        self.data_desc.push(desc.into());
        true
    }

    /// Appends a data row. Accepted only when `row.len()` equals the
    /// current column count; returns `false` (silent reject) otherwise.
    pub fn add_data_values(&mut self, row: Vec<String>) -> bool {
        if row.len() != self.data_desc.len() {
            return false;
        }
        self.data_rows.push(row);
        true
    }

    #[must_use]
    pub fn data_desc(&self) -> &[String] {
        &self.data_desc
    }

    #[must_use]
    pub fn data_rows(&self) -> &[Vec<String>] {
        &self.data_rows
    }

    /// Looks up the column index for a data description.
    #[must_use]
    pub fn find_data_desc(&self, desc: &str) -> Option<usize> {
        self.data_desc.iter().position(|d| d == desc)
    }

    /// Pushes a row without checking its arity against the column count.
    ///
    /// Used only by the codec when decoding a row whose arity does not
    /// match its column descriptions: accepted as-is on the wire, with the
    /// session layer responsible for tolerating the mismatch.
    pub(crate) fn force_push_row(&mut self, row: Vec<String>) {
        self.data_rows.push(row);
    }

    /// Converts this message to the legacy flat form: `(description,
    /// commondesc, common, data)`.
    #[must_use]
    pub fn to_flat(&self) -> FlatMessage {
        FlatMessage {
            command: self.command.clone(),
            description: join(&self.data_desc),
            commondesc: join(&self.common_desc),
            common: join(&self.common_values),
            data: self
                .data_rows
                .iter()
                .map(|row| join(row))
                .collect(),
        }
    }

    /// Builds a structured message from its legacy flat form.
    ///
    /// The split of each data row is suppressed (whole string is a single
    /// cell) when the target column count is 1; otherwise the split is
    /// unconstrained. This asymmetry matches the original wire contract.
    #[must_use]
    pub fn from_flat(flat: &FlatMessage) -> Self {
        let data_desc = split(&flat.description);
        let common_desc = split(&flat.commondesc);
        let common_values = split(&flat.common);
        let column_count = data_desc.len();

        let data_rows = flat
            .data
            .iter()
            .map(|row| {
                if column_count == 1 {
                    vec![row.clone()]
                } else {
                    split(row)
                }
            })
            .collect();

        Self {
            command: flat.command.clone(),
            common_desc,
            common_values,
            data_desc,
            data_rows,
        }
    }
}

/// The legacy flat form: five string fields besides `command`, with `data`
/// as a sequence of colon-joined rows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlatMessage {
    pub command: String,
    pub description: String,
    pub commondesc: String,
    pub common: String,
    pub data: Vec<String>,
}

fn join(parts: &[String]) -> String {
    parts.join(&SEP.to_string())
}

/// Splits `s` on `:`. Returns a single-element vector containing `s`
/// unchanged when `s` is empty, matching the original's "no elements" vs
/// "one empty element" edge case for an empty flat field.
fn split(s: &str) -> Vec<String> {
    if s.is_empty() {
        return Vec::new();
    }
    s.split(SEP).map(str::to_string).collect()
}
