//! # Point-record output
//!
//! Each inverted bunch emits one point record at its master sounding: a
//! row of fixed-width formatted columns, with a column map generated next
//! to it so downstream tooling can find fields by name. [`PointWriter`]
//! enforces the `begin_point_output` / `end_point_output` bracketing the
//! work-distribution collaborator relies on; fields staged between the
//! two calls become one output row.

use std::io::Write;

use crate::aem1d_errors::Aem1dError;
use crate::config::Block;

/// Output toggles of the `Output` control block.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputOptions {
    pub positive_layer_top_depths: bool,
    pub negative_layer_top_depths: bool,
    pub positive_layer_bottom_depths: bool,
    pub negative_layer_bottom_depths: bool,
    pub interface_elevations: bool,
    pub parameter_sensitivity: bool,
    pub parameter_uncertainty: bool,
    pub observed_data: bool,
    pub noise_estimates: bool,
    pub predicted_data: bool,
    /// Write only solved geometry elements in the inverted-geometry block.
    pub inverted_fields_only: bool,
}

impl OutputOptions {
    pub fn from_block(block: Option<&Block>) -> Self {
        let Some(b) = block else {
            return OutputOptions::default();
        };
        let get = |key: &str| b.get_bool(key).unwrap_or(false);
        OutputOptions {
            positive_layer_top_depths: get("PositiveLayerTopDepths"),
            negative_layer_top_depths: get("NegativeLayerTopDepths"),
            positive_layer_bottom_depths: get("PositiveLayerBottomDepths"),
            negative_layer_bottom_depths: get("NegativeLayerBottomDepths"),
            interface_elevations: get("InterfaceElevations"),
            parameter_sensitivity: get("ParameterSensitivity"),
            parameter_uncertainty: get("ParameterUncertainty"),
            observed_data: get("ObservedData"),
            noise_estimates: get("NoiseEstimates"),
            predicted_data: get("PredictedData"),
            inverted_fields_only: get("InvertedFieldsOnly"),
        }
    }
}

/// Column formatting of one output field.
#[derive(Debug, Clone, Copy)]
pub enum ColumnFormat {
    /// Integer with the given width.
    Integer(usize),
    /// Fixed point: width and decimals.
    Fixed(usize, usize),
    /// Scientific: width and decimals.
    Scientific(usize, usize),
}

impl ColumnFormat {
    fn format(&self, v: f64) -> String {
        match *self {
            ColumnFormat::Integer(w) => format!(" {:>w$}", v as i64, w = w),
            ColumnFormat::Fixed(w, d) => format!(" {v:>w$.d$}", w = w, d = d),
            ColumnFormat::Scientific(w, d) => format!(" {v:>w$.d$e}", w = w, d = d),
        }
    }
}

#[derive(Debug, Clone)]
struct FieldColumn {
    name: String,
    description: String,
    units: String,
    ncolumns: usize,
}

/// Writes one row of formatted columns per point.
pub struct PointWriter<W: Write> {
    out: W,
    columns: Vec<FieldColumn>,
    row: String,
    in_point: bool,
    points_written: usize,
}

impl<W: Write> PointWriter<W> {
    pub fn new(out: W) -> Self {
        PointWriter {
            out,
            columns: Vec::new(),
            row: String::new(),
            in_point: false,
            points_written: 0,
        }
    }

    /// Open a point record. Fields written until
    /// [`PointWriter::end_point_output`] form one row.
    pub fn begin_point_output(&mut self) -> Result<(), Aem1dError> {
        if self.in_point {
            return Err(Aem1dError::ConfigError(
                "begin_point_output called twice without end_point_output".to_string(),
            ));
        }
        self.in_point = true;
        self.row.clear();
        Ok(())
    }

    /// Stage one field of the current point.
    ///
    /// Arguments
    /// -----------------
    /// * `name`, `description`, `units`: Field metadata; recorded into
    ///   the column map on the first point only.
    /// * `format`: Column formatting.
    /// * `values`: One or more values; vectors fan out over consecutive
    ///   columns.
    pub fn write_field(
        &mut self,
        name: &str,
        description: &str,
        units: &str,
        format: ColumnFormat,
        values: &[f64],
    ) -> Result<(), Aem1dError> {
        if !self.in_point {
            return Err(Aem1dError::ConfigError(
                "write_field called outside a point record".to_string(),
            ));
        }
        if self.points_written == 0 {
            self.columns.push(FieldColumn {
                name: name.to_string(),
                description: description.to_string(),
                units: units.to_string(),
                ncolumns: values.len(),
            });
        }
        for &v in values {
            self.row.push_str(&format.format(v));
        }
        Ok(())
    }

    /// Close the point record and flush its row.
    pub fn end_point_output(&mut self) -> Result<(), Aem1dError> {
        if !self.in_point {
            return Err(Aem1dError::ConfigError(
                "end_point_output without begin_point_output".to_string(),
            ));
        }
        self.in_point = false;
        writeln!(self.out, "{}", self.row.trim_start())?;
        self.points_written += 1;
        Ok(())
    }

    pub fn points_written(&self) -> usize {
        self.points_written
    }

    /// Column map of the first record: `name first_column ncolumns
    /// units description`, one line per field, 1-based columns.
    pub fn column_map(&self) -> String {
        let mut s = String::new();
        let mut col = 1usize;
        for c in &self.columns {
            s.push_str(&format!(
                "{} {} {} {} {}\n",
                c.name, col, c.ncolumns, c.units, c.description
            ));
            col += c.ncolumns;
        }
        s
    }
}
