//! Command-list mode: a text file of raw IR loads and DR shifts.
//!
//! The file is a list of whitespace-separated tokens; `#` comments run to the
//! end of the line. `IR` and `DR` select where following values go. Values are
//! either `0x` followed by hex bytes, written most significant first, or a
//! decimal 32-bit integer.

use thiserror::Error;
use crate::buffer::Transport;
use crate::jtag::{Jtag, Error as JTAGError};
use crate::tap::TapState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Line {line}: {reason}: '{token}'")]
    Parse { token: String, line: usize, reason: &'static str },
    #[error("JTAG error")]
    JTAG(#[from] JTAGError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Step {
    /// Load an instruction into the target.
    Ir(u8),
    /// Shift bytes through the target's data register, bytes as written.
    Dr(Vec<u8>),
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Script {
    steps: Vec<Step>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Mode {
    Ir,
    Dr,
}

/// Split `text` into tokens with their 1-based line numbers.
fn tokens(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines().enumerate().flat_map(|(n, line)| {
        let line = line.split('#').next().unwrap_or("");
        line.split_whitespace().map(move |t| (n + 1, t))
    })
}

fn parse_value(token: &str, line: usize) -> Result<Vec<u8>> {
    let error = |reason| Error::Parse { token: token.to_string(), line, reason };
    match token.strip_prefix("0x") {
        Some(hex) if !hex.is_empty() => {
            if !hex.is_ascii() {
                return Err(error("invalid hex"));
            } else if hex.len() % 2 != 0 {
                return Err(error("hex values need whole bytes"));
            }
            (0..hex.len()).step_by(2)
                .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| error("invalid hex")))
                .collect()
        },
        _ => {
            let value: i32 = token.parse().map_err(|_| error("invalid number"))?;
            Ok(value.to_le_bytes().to_vec())
        },
    }
}

impl Script {
    pub fn parse(text: &str) -> Result<Self> {
        let mut mode = None;
        let mut steps = Vec::new();
        for (line, token) in tokens(text) {
            match token {
                "IR" => mode = Some(Mode::Ir),
                "DR" => mode = Some(Mode::Dr),
                _ => {
                    let value = parse_value(token, line)?;
                    match mode {
                        Some(Mode::Ir) => steps.push(Step::Ir(value[0])),
                        Some(Mode::Dr) => steps.push(Step::Dr(value)),
                        None => return Err(Error::Parse {
                            token: token.to_string(), line, reason: "IR or DR must come first",
                        }),
                    }
                },
            }
        }
        Ok(Script { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Execute every step against device `index`.
    ///
    /// Returns the data captured by each DR step as hex, in the same byte
    /// order as it was written.
    pub fn run<T: Transport>(&self, jtag: &mut Jtag<T>, index: usize) -> Result<Vec<String>> {
        let mut output = Vec::new();
        for step in &self.steps {
            match step {
                Step::Ir(opcode) => {
                    log::debug!("IR 0x{:02x}", opcode);
                    jtag.load_instruction_register(false, *opcode, index, TapState::Idle)?;
                    jtag.flush()?;
                },
                Step::Dr(bytes) => {
                    let data: Vec<u8> = bytes.iter().rev().copied().collect();
                    let captured = jtag.shift_dr(index, &data, true, false)?;
                    let hex: String = captured.iter().rev().map(|b| format!("{:02x}", b)).collect();
                    log::debug!("DR {:02x?} -> {}", bytes, hex);
                    output.push(hex);
                },
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimChain, SimDevice};

    #[test]
    fn test_parse() {
        let script = Script::parse("\
# Read USERCODE
IR 0x08   # USERCODE
DR 0x00000000 258
   -1
").unwrap();
        assert_eq!(script.steps(), &[
            Step::Ir(0x08),
            Step::Dr(vec![0, 0, 0, 0]),
            Step::Dr(vec![0x02, 0x01, 0, 0]),
            Step::Dr(vec![0xFF; 4]),
        ]);
        let script = Script::parse("DR 0x1234ab").unwrap();
        assert_eq!(script.steps(), &[Step::Dr(vec![0x12, 0x34, 0xAB])]);
    }

    #[test]
    fn test_parse_errors() {
        match Script::parse("IR 0x09\nDR 12x4") {
            Err(Error::Parse { token, line, .. }) => {
                assert_eq!(token, "12x4");
                assert_eq!(line, 2);
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(Script::parse("0x09"), Err(Error::Parse { line: 1, .. })));
        assert!(matches!(Script::parse("DR 0x123"), Err(Error::Parse { .. })));
        assert!(matches!(Script::parse("DR 0xzz"), Err(Error::Parse { .. })));
        assert!(matches!(Script::parse("DR 0x"), Err(Error::Parse { .. })));
        assert!(Script::parse("# IR only a comment\n").unwrap().steps().is_empty());
    }

    #[test]
    fn test_run_usercode() {
        let mut jtag = Jtag::new(SimChain::new(vec![SimDevice::cortex(),
                                                    SimDevice::xilinx(0x1363_6093)]));
        jtag.init(false).unwrap();
        jtag.discover_chain(true).unwrap();
        let script = Script::parse("IR 0x08\nDR 0x00000000\nIR 0x09 DR 0xffffffff").unwrap();
        let output = script.run(&mut jtag, 1).unwrap();
        assert_eq!(output, vec!["5eed0001".to_string(), "13636093".to_string()]);
        assert_eq!(jtag.transport().devices()[1].instruction(), 0x09);
    }
}
