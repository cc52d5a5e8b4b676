//! Generated protobuf bindings for the envoy v3 Secret Discovery Service.
//!
//! **This module contains generated code.** The `.proto` sources live under
//! `proto/` in this crate and are compiled by `build.rs`.
//!
//! Module nesting mirrors the protobuf packages, which the generated code relies
//! on for cross-package references.
#![allow(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(missing_docs)]
#![allow(missing_debug_implementations)]

pub mod envoy {
    pub mod config {
        pub mod core {
            pub mod v3 {
                tonic::include_proto!("envoy.config.core.v3");
            }
        }
    }

    pub mod extensions {
        pub mod transport_sockets {
            pub mod tls {
                pub mod v3 {
                    tonic::include_proto!("envoy.extensions.transport_sockets.tls.v3");
                }
            }
        }
    }

    pub mod service {
        pub mod discovery {
            pub mod v3 {
                tonic::include_proto!("envoy.service.discovery.v3");
            }
        }

        pub mod secret {
            pub mod v3 {
                tonic::include_proto!("envoy.service.secret.v3");
            }
        }
    }
}

pub mod google {
    pub mod rpc {
        tonic::include_proto!("google.rpc");
    }
}
