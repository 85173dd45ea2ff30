//! `ctrm` CLI subcommands: a thin surface over `ctrm-diskimage` and the host
//! helper session manager, enough to exercise pack/unpack/exec end to end
//! for manual testing (SPEC_FULL.md §2).

pub mod exec;
pub mod pack;
pub mod sidecar;
pub mod unpack;
