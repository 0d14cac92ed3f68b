//! # Tabular data input
//!
//! Soundings arrive as a record-oriented stream of whitespace-delimited
//! numeric columns, one record per sounding. [`TabularInput`] holds the
//! parsed records and serves field reads through the
//! [`FieldDefinition`]s of the control file; records that fail to parse
//! are kept as placeholders (so record numbering is stable) and reported
//! when a bunch touches them.
//!
//! [`TabularInput::get_bunch`] assembles the bunch of adjacent soundings
//! around a master record: members share the master's line number (a
//! bunch never crosses a flight-line boundary) and are spaced by the
//! `BunchSubsample` stride.

use std::io::BufRead;
use std::path::Path;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::aem1d_errors::Aem1dError;
use crate::config::FieldDefinition;

/// One assembled bunch: record numbers plus the position of the master
/// sounding within the bunch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bunch {
    records: SmallVec<[usize; 8]>,
    master: usize,
}

impl Bunch {
    /// Record numbers of the bunch members, in acquisition order.
    pub fn records(&self) -> &[usize] {
        &self.records
    }

    /// Number of soundings in the bunch.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Index of the master sounding within the bunch.
    pub fn master_index(&self) -> usize {
        self.master
    }

    /// Record number of the master sounding.
    pub fn master_record(&self) -> usize {
        self.records[self.master]
    }
}

/// Parsed record table.
#[derive(Debug, Clone)]
pub struct TabularInput {
    /// `None` marks a record whose line failed to parse.
    records: Vec<Option<Vec<f64>>>,
}

impl TabularInput {
    /// Read every record from `reader`. A line that contains a
    /// non-numeric token becomes an invalid placeholder record (reading
    /// it later is a [`Aem1dError::RecordError`] naming the record); the
    /// stream itself only fails on I/O errors.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, Aem1dError> {
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: Result<Vec<f64>, _> =
                line.split_whitespace().map(|t| t.parse::<f64>()).collect();
            records.push(parsed.ok());
        }
        Ok(TabularInput { records })
    }

    pub fn from_path(path: &Path) -> Result<Self, Aem1dError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Build directly from parsed rows; used by tests and by callers that
    /// assemble soundings in memory.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        TabularInput {
            records: rows.into_iter().map(Some).collect(),
        }
    }

    pub fn nrecords(&self) -> usize {
        self.records.len()
    }

    pub fn is_record_valid(&self, record: usize) -> bool {
        matches!(self.records.get(record), Some(Some(_)))
    }

    /// Read `n` consecutive values of `fd` from `record`.
    ///
    /// Return
    /// ----------
    /// * `Ok(Some(values))` when the field is available and in range.
    /// * `Ok(None)` when the field is `Unavailable`.
    /// * `Err(Aem1dError::RecordError)` for an invalid record or an
    ///   out-of-range column.
    pub fn read_field(
        &self,
        record: usize,
        fd: &FieldDefinition,
        n: usize,
    ) -> Result<Option<Vec<f64>>, Aem1dError> {
        match fd {
            FieldDefinition::Unavailable => Ok(None),
            FieldDefinition::Literal(values) => {
                if values.len() == 1 && n > 1 {
                    // A single literal fans out across all layers.
                    return Ok(Some(vec![values[0]; n]));
                }
                if values.len() < n {
                    return Err(Aem1dError::RecordError(format!(
                        "literal field supplies {} values, {} required",
                        values.len(),
                        n
                    )));
                }
                Ok(Some(values[..n].to_vec()))
            }
            FieldDefinition::Column { index, negate } => {
                let columns = self
                    .records
                    .get(record)
                    .ok_or_else(|| {
                        Aem1dError::RecordError(format!("record {record} is out of range"))
                    })?
                    .as_ref()
                    .ok_or_else(|| {
                        Aem1dError::RecordError(format!("record {record} is not valid"))
                    })?;
                let start = index - 1;
                if start + n > columns.len() {
                    return Err(Aem1dError::RecordError(format!(
                        "record {record} has {} columns, field needs columns {}..{}",
                        columns.len(),
                        index,
                        start + n
                    )));
                }
                let sign = if *negate { -1.0 } else { 1.0 };
                Ok(Some(
                    columns[start..start + n].iter().map(|&v| sign * v).collect(),
                ))
            }
        }
    }

    /// Scalar read of `fd` from `record`.
    pub fn read_scalar(
        &self,
        record: usize,
        fd: &FieldDefinition,
    ) -> Result<Option<f64>, Aem1dError> {
        Ok(self.read_field(record, fd, 1)?.map(|v| v[0]))
    }

    /// Read every ancillary field of `record` into a name-keyed map.
    pub fn read_ancillary(
        &self,
        record: usize,
        fields: &[(String, FieldDefinition)],
    ) -> Result<AHashMap<String, f64>, Aem1dError> {
        let mut out = AHashMap::with_capacity(fields.len());
        for (name, fd) in fields {
            if let Some(v) = self.read_scalar(record, fd)? {
                out.insert(name.to_ascii_lowercase(), v);
            }
        }
        Ok(out)
    }

    /// Assemble the bunch around master record `record`.
    ///
    /// Members are spaced by `stride` records, share the master's line
    /// number, and number at most `nsoundings`. The bunch grows forward
    /// from the master first, then backward, so it shortens rather than
    /// crosses a line boundary.
    ///
    /// Arguments
    /// -----------------
    /// * `line_fd`: Field definition of the line-number ancillary field.
    /// * `record`: Master record number.
    /// * `nsoundings`: Requested bunch size (`SoundingsPerBunch`).
    /// * `stride`: Spacing between members (`BunchSubsample`).
    ///
    /// Return
    /// ----------
    /// * `Ok(None)` past the end of the stream (normal termination).
    /// * `Ok(Some(bunch))` otherwise.
    /// * `Err(Aem1dError::RecordError)` when the master record (or its
    ///   line number) cannot be read.
    pub fn get_bunch(
        &self,
        line_fd: &FieldDefinition,
        record: usize,
        nsoundings: usize,
        stride: usize,
    ) -> Result<Option<Bunch>, Aem1dError> {
        if record >= self.nrecords() {
            return Ok(None);
        }
        let stride = stride.max(1);
        let master_line = self
            .read_scalar(record, line_fd)?
            .ok_or_else(|| Aem1dError::RecordError("line field is unavailable".to_string()))?;

        let same_line = |r: usize| -> bool {
            self.is_record_valid(r)
                && matches!(self.read_scalar(r, line_fd), Ok(Some(l)) if l == master_line)
        };

        let mut records: SmallVec<[usize; 8]> = SmallVec::new();
        records.push(record);
        // Forward first, then backward on the same line.
        let mut r = record;
        while records.len() < nsoundings {
            let Some(next) = r.checked_add(stride).filter(|&n| n < self.nrecords()) else {
                break;
            };
            if !same_line(next) {
                break;
            }
            records.push(next);
            r = next;
        }
        let mut r = record;
        while records.len() < nsoundings {
            let Some(prev) = r.checked_sub(stride) else {
                break;
            };
            if !same_line(prev) {
                break;
            }
            records.insert(0, prev);
            r = prev;
        }

        let master = records
            .iter()
            .position(|&x| x == record)
            .expect("master is a member");
        Ok(Some(Bunch { records, master }))
    }
}

/// Ancillary identifiers of one sounding, taken from the ancillary map.
#[derive(Debug, Clone, Default)]
pub struct SampleId {
    pub uniqueid: usize,
    pub survey: Option<f64>,
    pub date: Option<f64>,
    pub flight: Option<f64>,
    pub line: f64,
    pub fiducial: Option<f64>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub elevation: f64,
}

impl SampleId {
    /// Pick the well-known identifiers out of the ancillary field map.
    pub fn from_ancillary(record: usize, fields: &AHashMap<String, f64>) -> Self {
        SampleId {
            uniqueid: record,
            survey: fields.get("survey").copied(),
            date: fields.get("date").copied(),
            flight: fields.get("flight").copied(),
            line: fields.get("line").copied().unwrap_or(-1.0),
            fiducial: fields.get("fiducial").copied(),
            x: fields.get("x").copied(),
            y: fields.get("y").copied(),
            elevation: fields.get("groundelevation").copied().unwrap_or(0.0),
        }
    }
}

#[cfg(test)]
mod input_test {
    use super::*;

    fn line_fd() -> FieldDefinition {
        FieldDefinition::Column {
            index: 1,
            negate: false,
        }
    }

    fn table() -> TabularInput {
        // Column 1 = line number, column 2 = fiducial.
        TabularInput::from_rows(vec![
            vec![100.0, 1.0],
            vec![100.0, 2.0],
            vec![100.0, 3.0],
            vec![200.0, 4.0],
            vec![200.0, 5.0],
        ])
    }

    #[test]
    fn test_bunch_never_crosses_line_boundary() {
        let t = table();
        let bunch = t.get_bunch(&line_fd(), 2, 3, 1).unwrap().unwrap();
        // Record 3 is on line 200, so the bunch extends backward instead.
        assert_eq!(bunch.records(), &[0, 1, 2]);
        assert_eq!(bunch.master_record(), 2);
        assert_eq!(bunch.master_index(), 2);
    }

    #[test]
    fn test_bunch_shortens_on_small_lines() {
        let t = table();
        let bunch = t.get_bunch(&line_fd(), 3, 4, 1).unwrap().unwrap();
        assert_eq!(bunch.records(), &[3, 4]);
        assert_eq!(bunch.master_index(), 0);
    }

    #[test]
    fn test_bunch_subsample_stride() {
        let rows: Vec<Vec<f64>> = (0..10).map(|i| vec![1.0, i as f64]).collect();
        let t = TabularInput::from_rows(rows);
        let bunch = t.get_bunch(&line_fd(), 2, 3, 2).unwrap().unwrap();
        assert_eq!(bunch.records(), &[2, 4, 6]);
    }

    #[test]
    fn test_end_of_stream() {
        let t = table();
        assert!(t.get_bunch(&line_fd(), 7, 1, 1).unwrap().is_none());
    }

    #[test]
    fn test_invalid_records_are_skipped() {
        let text = "100 1.0 0.5\n100 oops 0.5\n100 3.0 0.5\n";
        let t = TabularInput::from_reader(text.as_bytes()).unwrap();
        assert_eq!(t.nrecords(), 3);
        assert!(t.is_record_valid(0));
        assert!(!t.is_record_valid(1));
        // The invalid middle record blocks bunch growth.
        let bunch = t.get_bunch(&line_fd(), 0, 3, 1).unwrap().unwrap();
        assert_eq!(bunch.records(), &[0]);
        // Reading from it is a record error.
        assert!(t
            .read_scalar(1, &line_fd())
            .is_err());
    }

    #[test]
    fn test_field_reads() {
        let t = TabularInput::from_rows(vec![vec![1.0, 2.0, 3.0, 4.0]]);
        let fd = FieldDefinition::Column {
            index: 2,
            negate: false,
        };
        assert_eq!(t.read_field(0, &fd, 2).unwrap().unwrap(), vec![2.0, 3.0]);

        let neg = FieldDefinition::Column {
            index: 4,
            negate: true,
        };
        assert_eq!(t.read_scalar(0, &neg).unwrap().unwrap(), -4.0);

        let lit = FieldDefinition::Literal(vec![0.01]);
        assert_eq!(
            t.read_field(0, &lit, 3).unwrap().unwrap(),
            vec![0.01, 0.01, 0.01]
        );

        assert!(t.read_field(0, &FieldDefinition::Unavailable, 1).unwrap().is_none());
        assert!(t
            .read_field(
                0,
                &FieldDefinition::Column {
                    index: 4,
                    negate: false
                },
                2
            )
            .is_err());
    }
}
