// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! x7tap
//!
//! Xilinx 7-series FPGA programming and ARM debug access using FTDI MPSSE
//! JTAG adapters.

#[macro_use]
pub mod bitvec;

pub mod mpsse;
pub mod buffer;
pub mod probe;
pub mod tap;
pub mod jtag;
pub mod bitstream;
pub mod xilinx;
pub mod cortex;
pub mod boundary;
pub mod script;

#[cfg(test)]
mod sim;

pub use bitstream::Bitstream;
pub use jtag::{Jtag, Chain, IDCODE};
pub use xilinx::{X7, X7IDCODE};
