//! Boundary-scan annotation.
//!
//! A BSDL file gives the meaning of every bit of the boundary register, and a
//! Vivado XDC constraints file maps package pins to top-level signal names.
//! Together they turn raw SAMPLE captures into a list of pin changes.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("BSDL file does not give a BOUNDARY_LENGTH.")]
    NoBoundaryLength,
    #[error("Boundary cell {cell} is outside the {length}-bit register.")]
    CellOutOfRange { cell: usize, length: usize },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Signal name used for cells without a known signal.
pub const UNKNOWN: &str = "<unknown>";

/// Pins whose changes are never reported unless a sensitivity list names them.
const IGNORED_SIGNALS: &[&str] = &["CLK_IN"];

/// Package pin to signal name map read from an XDC file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PinMap {
    signals: HashMap<String, String>,
}

impl PinMap {
    /// Collect every line naming both a `PACKAGE_PIN` and a `get_ports` target.
    pub fn parse_xdc(text: &str) -> Self {
        let mut signals = HashMap::new();
        for line in text.lines().filter(|l| !l.starts_with('#')) {
            let pin = line.find("PACKAGE_PIN").map(|i| {
                line[i + "PACKAGE_PIN".len()..].trim_start()
                    .split(|c: char| c.is_whitespace() || c == '}')
                    .next()
                    .unwrap_or("")
            });
            let signal = line.find("get_ports").map(|i| port_name(&line[i + "get_ports".len()..]));
            if let (Some(pin), Some(signal)) = (pin, signal) {
                if !pin.is_empty() && !signal.is_empty() {
                    log::trace!("XDC: pin {} is {}", pin, signal);
                    signals.insert(pin.to_string(), signal.to_string());
                }
            }
        }
        PinMap { signals }
    }

    pub fn signal(&self, pin: &str) -> Option<&str> {
        self.signals.get(pin).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

/// The argument of `get_ports`, up to its closing bracket, without braces.
fn port_name(rest: &str) -> &str {
    let mut depth = 0;
    let mut end = rest.len();
    for (i, c) in rest.char_indices() {
        match c {
            '[' => depth += 1,
            ']' if depth == 0 => { end = i; break; },
            ']' => depth -= 1,
            _ => (),
        }
    }
    rest[..end].trim().trim_start_matches('{').trim_end_matches('}').trim()
}

/// One cell of the boundary register.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Cell {
    pub name: String,
    /// Cell function, e.g. `input`, `output3` or `control`.
    pub function: String,
    pub safe: String,
}

impl Cell {
    /// Package pin, the part of the port name after its last underscore.
    pub fn pin(&self) -> &str {
        self.name.rsplit('_').next().unwrap_or(&self.name)
    }

    pub fn is_input(&self) -> bool {
        self.function == "input"
    }
}

/// Boundary register description read from a BSDL file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Bsdl {
    pub part: String,
    cells: Vec<Option<Cell>>,
}

impl Bsdl {
    pub fn parse(text: &str) -> Result<Self> {
        let mut part = None;
        let mut entries = Vec::new();
        for line in text.lines() {
            if let Some((name, length)) = parse_length(line) {
                part = Some((name.to_string(), length));
            } else if let Some(entry) = parse_cell(line) {
                entries.push(entry);
            }
        }
        let (part, length) = part.ok_or(Error::NoBoundaryLength)?;
        log::info!("Boundary scan of {}: {} bits", part, length);
        let mut cells = vec![None; length];
        for (number, cell) in entries {
            match cells.get_mut(number) {
                Some(slot) => *slot = Some(cell),
                None => return Err(Error::CellOutOfRange { cell: number, length }),
            }
        }
        Ok(Bsdl { part, cells })
    }

    /// Length of the boundary register in bits.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cell(&self, bit: usize) -> Option<&Cell> {
        self.cells.get(bit).and_then(|c| c.as_ref())
    }
}

/// `attribute BOUNDARY_LENGTH of PART : entity is N;`
fn parse_length(line: &str) -> Option<(&str, usize)> {
    let rest = line.trim().strip_prefix("attribute BOUNDARY_LENGTH of ")?;
    let (part, rest) = rest.split_once(':')?;
    let length = rest.trim().strip_prefix("entity is")?.trim().trim_end_matches(';').trim();
    Some((part.trim(), length.parse().ok()?))
}

/// `"  N (BC_x, NAME, function, safe[, ...])"`
fn parse_cell(line: &str) -> Option<(usize, Cell)> {
    let rest = line.trim().strip_prefix('"')?.trim_start();
    let (number, rest) = rest.split_once(' ')?;
    let number = number.parse().ok()?;
    let rest = rest.trim_start().strip_prefix("(BC_")?;
    let mut fields = rest.split(',').skip(1).map(str::trim);
    let name = fields.next()?;
    let function = fields.next()?;
    let safe = fields.next()?.split(')').next()?.trim();
    Some((number, Cell { name: name.to_string(), function: function.to_string(),
                         safe: safe.to_string() }))
}

/// A reported boundary bit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Change {
    pub bit: usize,
    pub name: String,
    pub pin: String,
    pub signal: String,
    pub value: bool,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bit#{} : {} (pin {}, signal {}) = {:x}",
               self.bit, self.name, self.pin, self.signal, self.value as u8)
    }
}

#[derive(Clone, Debug)]
struct BitInfo {
    cell: Option<Cell>,
    signal: String,
    show: bool,
    ignore: bool,
}

/// Compares successive boundary samples and reports changed input cells.
pub struct Annotator {
    bits: Vec<BitInfo>,
    filtered: bool,
    last: Option<Vec<bool>>,
}

impl Annotator {
    /// `sensitivity`, if given, lists the only signals whose changes are
    /// reported (case-insensitive substring match against the list).
    pub fn new(bsdl: &Bsdl, pins: &PinMap, sensitivity: Option<&str>) -> Self {
        let sensitivity = sensitivity.map(|s| s.to_lowercase());
        let bits = (0..bsdl.len()).map(|i| {
            let cell = bsdl.cell(i).cloned();
            let (signal, matched) = match &cell {
                Some(cell) => {
                    let known = pins.signal(cell.pin());
                    let signal = known.unwrap_or(UNKNOWN);
                    let signal = if cell.is_input() {
                        signal.to_string()
                    } else {
                        format!("{}.ctl", signal)
                    };
                    (signal, known.unwrap_or(cell.pin()).to_string())
                },
                None => (UNKNOWN.to_string(), UNKNOWN.to_string()),
            };
            let ignore = match &sensitivity {
                Some(list) => {
                    let listed = list.contains(&matched.to_lowercase());
                    if listed {
                        log::info!("Adding '{}' to sensitivity list", matched);
                    }
                    !listed
                },
                None => IGNORED_SIGNALS.contains(&matched.as_str()),
            };
            let show = cell.as_ref().map(Cell::is_input).unwrap_or(false);
            BitInfo { cell, signal, show, ignore }
        }).collect();
        Annotator { bits, filtered: sensitivity.is_some(), last: None }
    }

    /// Compare `sample` against the previous one.
    ///
    /// On the first sample every input cell is reported, unless a
    /// sensitivity list is active, in which case only listed ones are.
    pub fn update(&mut self, sample: &[bool]) -> Vec<Change> {
        let first = self.last.is_none();
        let mut changes = Vec::new();
        for (i, info) in self.bits.iter().enumerate() {
            let value = sample.get(i).copied().unwrap_or(false);
            let previous = self.last.as_ref().and_then(|l| l.get(i).copied()).unwrap_or(false);
            if !info.show || !(first || value != previous) {
                continue;
            }
            if (first && !self.filtered) || !info.ignore {
                let (name, pin) = match &info.cell {
                    Some(cell) => (cell.name.clone(), cell.pin().to_string()),
                    None => (UNKNOWN.to_string(), UNKNOWN.to_string()),
                };
                changes.push(Change { bit: i, name, pin, signal: info.signal.clone(), value });
            }
        }
        self.last = Some(sample.to_vec());
        changes
    }
}
