//! # Control file
//!
//! The inversion is configured by a hierarchical block file:
//!
//! ```text
//! Control Begin
//!     Options Begin
//!         SoundingsPerBunch = 1
//!         AlphaConductivity = 1.0
//!         NormType = L2
//!     End
//!     Input Begin
//!         AncillaryFields Begin
//!             Line = Column 1
//!         End
//!         Earth Begin
//!             NumberOfLayers = 3
//!             Conductivity Begin
//!                 Solve = yes
//!                 Ref = Column 10
//!             End
//!         End
//!     End
//! End
//! ```
//!
//! A block opens with `Name Begin` and closes with a bare `End`; entries
//! are `Key = Value` lines; `//` starts a comment. Keys, block names and
//! enum values are case-insensitive. [`Block`] is the parsed tree and
//! [`ControlFile`] layers the typed accessors for the sections the
//! inverter needs on top of it.

use std::path::Path;
use std::str::FromStr;

use nom::{
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::{digit1, space0, space1},
    combinator::{all_consuming, opt},
    sequence::tuple,
    IResult,
};

use crate::aem1d_errors::Aem1dError;
use crate::forward::SystemSpec;
use crate::geometry::GeometryElement;
use crate::regularisation::{Alphas, SmoothnessMethod};

/// Which norm the data misfit uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormType {
    L1,
    #[default]
    L2,
}

impl FromStr for NormType {
    type Err = Aem1dError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("L1") {
            Ok(NormType::L1)
        } else if s.eq_ignore_ascii_case("L2") {
            Ok(NormType::L2)
        } else {
            Err(Aem1dError::UnknownEnumValue {
                kind: "NormType",
                value: s.to_string(),
            })
        }
    }
}

/// One parsed block: named entries plus nested child blocks.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub name: String,
    pub entries: Vec<(String, String)>,
    pub children: Vec<Block>,
}

/// One line of the control file, classified.
#[derive(Debug, PartialEq)]
enum Line<'a> {
    Begin(&'a str),
    End,
    Entry(&'a str, &'a str),
    Blank,
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(input)
}

fn block_begin(input: &str) -> IResult<&str, &str> {
    let (rest, (_, name, _, _, _)) =
        all_consuming(tuple((space0, identifier, space1, tag_no_case("Begin"), space0)))(input)?;
    Ok((rest, name))
}

fn block_end(input: &str) -> IResult<&str, ()> {
    let (rest, _) = all_consuming(tuple((space0, tag_no_case("End"), space0)))(input)?;
    Ok((rest, ()))
}

fn entry(input: &str) -> IResult<&str, (&str, &str)> {
    let (rest, (_, key, _, _, value)) = all_consuming(tuple((
        space0,
        take_while1(|c: char| c != '='),
        tag("="),
        space0,
        nom::combinator::rest,
    )))(input)?;
    Ok((rest, (key.trim(), value.trim())))
}

fn classify(raw: &str) -> Result<Line<'_>, Aem1dError> {
    let line = match raw.find("//") {
        Some(pos) => &raw[..pos],
        None => raw,
    };
    let line = line.trim_end();
    if line.trim().is_empty() {
        return Ok(Line::Blank);
    }
    if let Ok((_, ())) = block_end(line) {
        return Ok(Line::End);
    }
    if let Ok((_, name)) = block_begin(line) {
        return Ok(Line::Begin(name));
    }
    if let Ok((_, (key, value))) = entry(line) {
        return Ok(Line::Entry(key, value));
    }
    Err(Aem1dError::ControlParseError(format!(
        "unrecognised line: {}",
        line.trim()
    )))
}

impl Block {
    /// Parse the control file text into its root block.
    ///
    /// Return
    /// ----------
    /// * `Ok(Block)` for a well-formed file with exactly one root block.
    /// * `Err(Aem1dError::ControlParseError)` on unbalanced blocks or an
    ///   unrecognised line.
    pub fn parse_str(text: &str) -> Result<Block, Aem1dError> {
        let mut stack: Vec<Block> = Vec::new();
        let mut roots: Vec<Block> = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            match classify(raw)? {
                Line::Blank => {}
                Line::Begin(name) => stack.push(Block {
                    name: name.to_string(),
                    ..Default::default()
                }),
                Line::End => {
                    let done = stack.pop().ok_or_else(|| {
                        Aem1dError::ControlParseError(format!(
                            "unmatched End at line {}",
                            lineno + 1
                        ))
                    })?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(done),
                        None => roots.push(done),
                    }
                }
                Line::Entry(key, value) => {
                    let top = stack.last_mut().ok_or_else(|| {
                        Aem1dError::ControlParseError(format!(
                            "entry outside any block at line {}",
                            lineno + 1
                        ))
                    })?;
                    top.entries.push((key.to_string(), value.to_string()));
                }
            }
        }

        if !stack.is_empty() {
            return Err(Aem1dError::ControlParseError(format!(
                "block {} is never closed",
                stack.last().expect("non-empty").name
            )));
        }
        match roots.len() {
            1 => Ok(roots.remove(0)),
            n => Err(Aem1dError::ControlParseError(format!(
                "expected one root block, found {n}"
            ))),
        }
    }

    /// Child block addressed by a dotted, case-insensitive path
    /// (e.g. `"Input.Earth.Conductivity"`).
    pub fn find_block(&self, path: &str) -> Option<&Block> {
        let mut current = self;
        for part in path.split('.') {
            current = current
                .children
                .iter()
                .find(|b| b.name.eq_ignore_ascii_case(part))?;
        }
        Some(current)
    }

    /// All direct children named `name` (case-insensitive); used for the
    /// repeated `EMSystem` blocks.
    pub fn find_blocks(&self, name: &str) -> Vec<&Block> {
        self.children
            .iter()
            .filter(|b| b.name.eq_ignore_ascii_case(name))
            .collect()
    }

    /// Raw value of `key` (case-insensitive), if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Booleans accept `yes/no`, `true/false`, `1/0`.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| {
            if v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("true") || v == "1" {
                Some(true)
            } else if v.eq_ignore_ascii_case("no") || v.eq_ignore_ascii_case("false") || v == "0" {
                Some(false)
            } else {
                None
            }
        })
    }

    fn require_f64(&self, key: &str) -> Result<f64, Aem1dError> {
        self.get_f64(key)
            .ok_or_else(|| Aem1dError::MissingField(format!("{}.{}", self.name, key)))
    }
}

/// Where a field's values come from: a (possibly negated) 1-based column
/// of the data record, a literal vector, or nowhere.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldDefinition {
    #[default]
    Unavailable,
    Column {
        /// 1-based first column of the field.
        index: usize,
        negate: bool,
    },
    Literal(Vec<f64>),
}

fn column_def(input: &str) -> IResult<&str, FieldDefinition> {
    let (rest, (_, neg, _, _, idx, _)) = all_consuming(tuple((
        space0,
        opt(tag("-")),
        tag_no_case("Column"),
        space1,
        digit1,
        space0,
    )))(input)?;
    Ok((
        rest,
        FieldDefinition::Column {
            index: idx.parse().expect("digits"),
            negate: neg.is_some(),
        },
    ))
}

impl FromStr for FieldDefinition {
    type Err = Aem1dError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("Unavailable") || s.eq_ignore_ascii_case("None") {
            return Ok(FieldDefinition::Unavailable);
        }
        if let Ok((_, fd)) = column_def(s) {
            return Ok(fd);
        }
        let values: Result<Vec<f64>, _> = s.split_whitespace().map(|t| t.parse()).collect();
        match values {
            Ok(v) if !v.is_empty() => Ok(FieldDefinition::Literal(v)),
            _ => Err(Aem1dError::ControlParseError(format!(
                "cannot parse field definition: {s}"
            ))),
        }
    }
}

impl FieldDefinition {
    pub fn is_available(&self) -> bool {
        !matches!(self, FieldDefinition::Unavailable)
    }
}

/// Solve controls and value sources of one invertible quantity, as
/// declared by its control block.
#[derive(Debug, Clone, Default)]
pub struct InvertibleFieldSpec {
    pub solve: bool,
    pub bound: bool,
    pub input: FieldDefinition,
    pub reference: FieldDefinition,
    pub std: FieldDefinition,
    pub min: FieldDefinition,
    pub max: FieldDefinition,
    pub tfr: FieldDefinition,
}

impl InvertibleFieldSpec {
    /// Read the spec from a quantity block; a missing block means the
    /// quantity is fixed and unavailable.
    pub fn from_block(block: Option<&Block>) -> Result<Self, Aem1dError> {
        let Some(b) = block else {
            return Ok(InvertibleFieldSpec::default());
        };
        let fd = |key: &str| -> Result<FieldDefinition, Aem1dError> {
            match b.get(key) {
                Some(v) => v.parse(),
                None => Ok(FieldDefinition::Unavailable),
            }
        };
        Ok(InvertibleFieldSpec {
            solve: b.get_bool("Solve").unwrap_or(false),
            bound: b.get_bool("Bound").unwrap_or(false),
            input: fd("Input")?,
            reference: fd("Ref")?,
            std: fd("Std")?,
            min: fd("Min")?,
            max: fd("Max")?,
            tfr: fd("TFR")?,
        })
    }
}

/// The `Options` section of the control file.
#[derive(Debug, Clone)]
pub struct Options {
    pub soundings_per_bunch: usize,
    pub bunch_subsample: usize,
    pub alphas: Alphas,
    pub norm_type: NormType,
    pub smoothness: SmoothnessMethod,
    pub begin_geometry_solve_iteration: usize,
    pub max_iterations: usize,
    pub min_phid: f64,
    pub min_percent_improvement: f64,
}

impl Options {
    /// Parse the `Options` block.
    ///
    /// `SoundingsPerBunch` and `BunchSubsample` default to 1; the alphas,
    /// `MaximumIterations`, `MinimumPhiD` and
    /// `MinimumPercentageImprovement` are required.
    pub fn from_block(b: &Block) -> Result<Options, Aem1dError> {
        let norm_type = match b.get("NormType") {
            Some(v) => v.parse()?,
            None => NormType::default(),
        };
        let smoothness = match b.get("SmoothnessMethod") {
            Some(v) => v.parse()?,
            None => SmoothnessMethod::default(),
        };
        Ok(Options {
            soundings_per_bunch: b.get_usize("SoundingsPerBunch").unwrap_or(1),
            bunch_subsample: b.get_usize("BunchSubsample").unwrap_or(1),
            alphas: Alphas {
                conductivity: b.require_f64("AlphaConductivity")?,
                thickness: b.require_f64("AlphaThickness")?,
                geometry: b.require_f64("AlphaGeometry")?,
                smoothness: b.require_f64("AlphaSmoothness")?,
                homogeneity: b.require_f64("AlphaHomogeneous")?,
            },
            norm_type,
            smoothness,
            begin_geometry_solve_iteration: b.get_usize("BeginGeometrySolveIteration").unwrap_or(0),
            max_iterations: b
                .get_usize("MaximumIterations")
                .ok_or_else(|| Aem1dError::MissingField("Options.MaximumIterations".into()))?,
            min_phid: b.require_f64("MinimumPhiD")?,
            min_percent_improvement: b.require_f64("MinimumPercentageImprovement")?,
        })
    }
}

/// The parsed control file with typed accessors per section.
#[derive(Debug, Clone)]
pub struct ControlFile {
    root: Block,
}

impl ControlFile {
    pub fn from_str(text: &str) -> Result<Self, Aem1dError> {
        Ok(ControlFile {
            root: Block::parse_str(text)?,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, Aem1dError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    pub fn root(&self) -> &Block {
        &self.root
    }

    pub fn options(&self) -> Result<Options, Aem1dError> {
        let b = self
            .root
            .find_block("Options")
            .ok_or_else(|| Aem1dError::MissingField("Options".into()))?;
        Options::from_block(b)
    }

    /// Ancillary field definitions, in declaration order.
    ///
    /// A `line` field is mandatory: bunches must never cross a flight-line
    /// boundary, so the inverter cannot run without it.
    pub fn ancillary_fields(&self) -> Result<Vec<(String, FieldDefinition)>, Aem1dError> {
        let b = self
            .root
            .find_block("Input.AncillaryFields")
            .ok_or_else(|| Aem1dError::MissingField("Input.AncillaryFields".into()))?;
        let fields: Result<Vec<_>, Aem1dError> = b
            .entries
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.parse::<FieldDefinition>()?)))
            .collect();
        let fields = fields?;
        if !fields.iter().any(|(k, _)| k.eq_ignore_ascii_case("line")) {
            return Err(Aem1dError::ConfigError(
                "a linenumber field must be specified in Input.AncillaryFields".to_string(),
            ));
        }
        Ok(fields)
    }

    /// Number of layers of the earth parameterisation.
    pub fn nlayers(&self) -> Result<usize, Aem1dError> {
        self.root
            .find_block("Input.Earth")
            .and_then(|b| b.get_usize("NumberOfLayers"))
            .ok_or_else(|| Aem1dError::MissingField("Input.Earth.NumberOfLayers".into()))
    }

    pub fn conductivity_spec(&self) -> Result<InvertibleFieldSpec, Aem1dError> {
        InvertibleFieldSpec::from_block(self.root.find_block("Input.Earth.Conductivity"))
    }

    pub fn thickness_spec(&self) -> Result<InvertibleFieldSpec, Aem1dError> {
        InvertibleFieldSpec::from_block(self.root.find_block("Input.Earth.Thickness"))
    }

    /// Per-element geometry specs, indexed in element declaration order.
    pub fn geometry_specs(&self) -> Result<Vec<InvertibleFieldSpec>, Aem1dError> {
        let geometry = self.root.find_block("Input.Geometry");
        GeometryElement::ALL
            .iter()
            .map(|e| {
                InvertibleFieldSpec::from_block(geometry.and_then(|g| {
                    g.children
                        .iter()
                        .find(|b| b.name.eq_ignore_ascii_case(e.name()))
                }))
            })
            .collect()
    }

    pub fn output_block(&self) -> Option<&Block> {
        self.root.find_block("Output")
    }

    /// The `EMSystem` blocks, parsed into [`SystemSpec`]s paired with the
    /// component data sources (secondary and noise per component).
    pub fn em_systems(&self) -> Result<Vec<EmSystemConfig>, Aem1dError> {
        let blocks = self.root.find_blocks("EMSystem");
        if blocks.is_empty() {
            return Err(Aem1dError::MissingField("EMSystem".into()));
        }
        blocks.into_iter().map(EmSystemConfig::from_block).collect()
    }
}

/// Configuration of one EM system: its inversion flags plus the record
/// columns its observed data come from.
#[derive(Debug, Clone)]
pub struct EmSystemConfig {
    pub spec: SystemSpec,
    /// Per component X/Y/Z.
    pub secondary: [FieldDefinition; 3],
    pub noise: [FieldDefinition; 3],
    pub primary: [FieldDefinition; 3],
}

impl EmSystemConfig {
    fn component(b: &Block, name: &str, key: &str) -> Result<FieldDefinition, Aem1dError> {
        match b.find_block(name).and_then(|c| c.get(key)) {
            Some(v) => v.parse(),
            None => Ok(FieldDefinition::Unavailable),
        }
    }

    pub fn from_block(b: &Block) -> Result<Self, Aem1dError> {
        let nwindows = b
            .get_usize("NumberOfWindows")
            .ok_or_else(|| Aem1dError::MissingField("EMSystem.NumberOfWindows".into()))?;
        let comps = ["XComponent", "YComponent", "ZComponent"];
        let mut secondary: [FieldDefinition; 3] = Default::default();
        let mut noise: [FieldDefinition; 3] = Default::default();
        let mut primary: [FieldDefinition; 3] = Default::default();
        let mut used = [false; 3];
        for (ci, name) in comps.iter().enumerate() {
            used[ci] = b
                .find_block(name)
                .and_then(|c| c.get_bool("Use"))
                .unwrap_or(false);
            secondary[ci] = Self::component(b, name, "Secondary")?;
            noise[ci] = Self::component(b, name, "Noise")?;
            primary[ci] = Self::component(b, name, "Primary")?;
        }
        Ok(EmSystemConfig {
            spec: SystemSpec {
                nwindows,
                use_x: used[0],
                use_y: used[1],
                use_z: used[2],
                invert_x_plus_z: b.get_bool("InvertXPlusZ").unwrap_or(false),
                invert_primary_plus_secondary: b
                    .get_bool("InvertTotalField")
                    .unwrap_or(false),
                reconstruct_primary: b
                    .get_bool("ReconstructPrimaryFieldFromInputGeometry")
                    .unwrap_or(false),
            },
            secondary,
            noise,
            primary,
        })
    }
}

#[cfg(test)]
mod config_test {
    use super::*;

    const CONTROL: &str = r#"
Control Begin
    Options Begin
        SoundingsPerBunch = 3
        BunchSubsample = 2
        AlphaConductivity = 1.0
        AlphaThickness = 0.0
        AlphaGeometry = 0.5
        AlphaSmoothness = 250.0
        AlphaHomogeneous = 0.0
        NormType = L2                      // default anyway
        SmoothnessMethod = Minimise2ndDerivatives
        MaximumIterations = 25
        MinimumPhiD = 1.0
        MinimumPercentageImprovement = 5.0
    End

    Input Begin
        AncillaryFields Begin
            Line = Column 1
            Fiducial = Column 2
        End
        Geometry Begin
            TX_Height Begin
                Solve = yes
                Input = Column 5
                Ref = Column 5
                Std = 1.0
            End
        End
        Earth Begin
            NumberOfLayers = 3
            Conductivity Begin
                Solve = yes
                Bound = yes
                Ref = 0.01 0.01 0.01
                Std = 0.5 0.5 0.5
                Min = 0.0001 0.0001 0.0001
                Max = 10 10 10
            End
            Thickness Begin
                Solve = no
                Input = 20 40
            End
        End
    End

    Output Begin
        PredictedData = yes
    End

    EMSystem Begin
        NumberOfWindows = 2
        InvertXPlusZ = no
        ZComponent Begin
            Use = yes
            Secondary = Column 10
            Noise = Column 12
        End
    End
End
"#;

    #[test]
    fn test_parse_options() {
        let cf = ControlFile::from_str(CONTROL).unwrap();
        let opt = cf.options().unwrap();
        assert_eq!(opt.soundings_per_bunch, 3);
        assert_eq!(opt.bunch_subsample, 2);
        assert_eq!(opt.alphas.smoothness, 250.0);
        assert_eq!(opt.norm_type, NormType::L2);
        assert_eq!(opt.smoothness, SmoothnessMethod::SecondDerivative);
        assert_eq!(opt.max_iterations, 25);
        assert_eq!(opt.min_percent_improvement, 5.0);
    }

    #[test]
    fn test_field_definitions() {
        assert_eq!(
            "Column 7".parse::<FieldDefinition>().unwrap(),
            FieldDefinition::Column {
                index: 7,
                negate: false
            }
        );
        assert_eq!(
            "-Column 3".parse::<FieldDefinition>().unwrap(),
            FieldDefinition::Column {
                index: 3,
                negate: true
            }
        );
        assert_eq!(
            "0.01 0.02".parse::<FieldDefinition>().unwrap(),
            FieldDefinition::Literal(vec![0.01, 0.02])
        );
        assert_eq!(
            "Unavailable".parse::<FieldDefinition>().unwrap(),
            FieldDefinition::Unavailable
        );
        assert!("Column x".parse::<FieldDefinition>().is_err());
    }

    #[test]
    fn test_earth_and_geometry_specs() {
        let cf = ControlFile::from_str(CONTROL).unwrap();
        assert_eq!(cf.nlayers().unwrap(), 3);
        let c = cf.conductivity_spec().unwrap();
        assert!(c.solve && c.bound);
        assert_eq!(c.reference, FieldDefinition::Literal(vec![0.01; 3]));
        let t = cf.thickness_spec().unwrap();
        assert!(!t.solve);

        let g = cf.geometry_specs().unwrap();
        assert!(g[GeometryElement::TxHeight.index()].solve);
        assert!(!g[GeometryElement::RxPitch.index()].solve);
    }

    #[test]
    fn test_line_field_is_mandatory() {
        let text = CONTROL.replace("Line = Column 1", "Flight = Column 1");
        let cf = ControlFile::from_str(&text).unwrap();
        assert!(matches!(
            cf.ancillary_fields(),
            Err(Aem1dError::ConfigError(_))
        ));
    }

    #[test]
    fn test_em_system_block() {
        let cf = ControlFile::from_str(CONTROL).unwrap();
        let systems = cf.em_systems().unwrap();
        assert_eq!(systems.len(), 1);
        let s = &systems[0];
        assert_eq!(s.spec.nwindows, 2);
        assert!(s.spec.use_z && !s.spec.use_x);
        assert_eq!(
            s.secondary[2],
            FieldDefinition::Column {
                index: 10,
                negate: false
            }
        );
    }

    #[test]
    fn test_unbalanced_blocks_rejected() {
        assert!(Block::parse_str("Control Begin\n  Options Begin\nEnd\n").is_err());
        assert!(Block::parse_str("End\n").is_err());
        assert!(Block::parse_str("A Begin\nEnd\nB Begin\nEnd\n").is_err());
    }
}
