//! Generated client/server stubs for the compute grid wire protocol.
//!
//! The message and service definitions live in `proto/grid/v1/grid.proto`;
//! `build.rs` runs them through `tonic-build` at compile time.

pub mod grid {
    pub mod v1 {
        tonic::include_proto!("grid.v1");
    }
}
