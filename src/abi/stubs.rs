//! Stubs for ABI names this host does not implement: `req_inspect`,
//! `req_on_behalf_of`, the `downstream_tls_*` family, and anything a
//! newer guest SDK imports that isn't in the catalog this host binds
//! (§4.K: "bound to a typed stub of the correct arity that logs the
//! call and returns 0"). `linking.rs` wraps this one function at every
//! arity the guest's import table actually asks for.

use crate::error::XqdError;

/// Logs the call and reports `Unsupported` (§4.K, §6 `req_inspect`:
/// "returns Unsupported"). Guests compiled against older SDKs generally
/// treat `Unsupported` the same as the feature being absent.
pub fn unsupported(name: &str) -> Result<(), XqdError> {
    tracing::warn!(abi_fn = name, "call into unimplemented ABI function");
    Err(XqdError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_always_errors() {
        assert!(matches!(unsupported("xqd_req_inspect"), Err(XqdError::Unsupported)));
    }
}
