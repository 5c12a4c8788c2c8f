//! Contains all of the types needed to specify options for a [`Client`](crate::Client).
//!
//! Most of the options structs in this module use the
//! [`typed-builder`](https://crates.io/crates/typed-builder) crate to derive a type-safe builder
//! API on them. For example, to create an instance of
//! [`ClientOptions`](struct.ClientOptions.html) with only `hosts` and `app_name` set, the
//! builder API can be used as follows:
//!
//! ```rust
//! use mongodb_core::options::{ClientOptions, ServerAddress};
//!
//! let options = ClientOptions::builder()
//!     .hosts(vec![ServerAddress::Tcp {
//!         host: "localhost".to_string(),
//!         port: Some(27017),
//!     }])
//!     .app_name(Some("app".to_string()))
//!     .build();
//! ```

pub use crate::{
    client::{auth::*, options::*},
    compression::*,
    concern::*,
    selection_criteria::*,
};

/// Merges the options from src into dst if not already present.
#[cfg(test)]
macro_rules! merge_options {
    ($src:expr, $dst:expr, [$( $field:ident ),+] ) => {
        $(
            if let Some(option) = $src.$field {
                if !$dst.$field.is_some() {
                    $dst.$field = Some(option.clone());
                }
            }
        )+
    };
}
