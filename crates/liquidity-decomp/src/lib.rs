//! Decompiler from stack instructions back to expression trees.
//!
//! Decompilation runs in two passes. [`interp`] symbolically executes the
//! code and records every value in a [`graph::Graph`]; [`reconstruct`] walks
//! the graph's chains and rebuilds a [`SyntaxExp`], binding shared or
//! effectful values with `let` and inlining the rest.

use liquidity_ast::{ContractCode, Syntax, SyntaxExp};
use liquidity_diag::{Category, Diagnostic, DiagnosticError, LocatedError, Location};
use liquidity_michelson::{MicContract, Michelson};
use liquidity_types::Datatype;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod graph;
mod interp;
mod reconstruct;

use interp::Interp;

/// Knobs for the reconstruction. All are on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompileOptions {
    /// Merge `COMPARE` followed by `EQ`/`LT`/... into one comparison.
    pub fold_comparisons: bool,
    /// Resolve `CAR`/`CDR`/`UNPAIR` of a known pair to its components.
    pub fold_pairs: bool,
    /// Name values after variable annotations and `RENAME`.
    pub use_annotations: bool,
    /// Rebuild `ISNAT` followed by `IF_NONE` as a match on the sign.
    pub match_nat: bool,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            fold_comparisons: true,
            fold_pairs: true,
            use_annotations: true,
            match_nat: true,
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DecompileError {
    #[error("`{instr}` needs {needed} stack values, found {found}")]
    StackUnderflow {
        instr: &'static str,
        needed: usize,
        found: usize,
        loc: Location,
    },
    #[error("branches of `{instr}` leave {then_depth} and {else_depth} values")]
    BranchArity {
        instr: &'static str,
        then_depth: usize,
        else_depth: usize,
        loc: Location,
    },
    #[error("body of `{instr}` leaves {found} values, expected {expected}")]
    LoopArity {
        instr: &'static str,
        expected: usize,
        found: usize,
        loc: Location,
    },
    #[error("lambda body leaves {found} values, expected 1")]
    LambdaArity { found: usize, loc: Location },
    #[error("unreachable `{instr}` after a failure")]
    UnreachableCode { instr: &'static str, loc: Location },
    #[error("cannot decompile {what}")]
    Unsupported { what: String, loc: Location },
}

impl DecompileError {
    pub fn location(&self) -> &Location {
        match self {
            DecompileError::StackUnderflow { loc, .. }
            | DecompileError::BranchArity { loc, .. }
            | DecompileError::LoopArity { loc, .. }
            | DecompileError::LambdaArity { loc, .. }
            | DecompileError::UnreachableCode { loc, .. }
            | DecompileError::Unsupported { loc, .. } => loc,
        }
    }

    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::error(Category::Decompile, self.to_string()).at(self.location().clone())
    }
}

impl From<DecompileError> for LocatedError {
    fn from(err: DecompileError) -> Self {
        LocatedError::new(err.location().clone(), err.to_string())
    }
}

impl From<DecompileError> for DiagnosticError {
    fn from(err: DecompileError) -> Self {
        DiagnosticError::single(err.to_diagnostic())
    }
}

/// Decompile a code block run on named inputs. `inputs[0]` is the top of
/// the stack.
///
/// The result is the value the code leaves above the untouched bottom of the
/// input stack: a single value as is, several as a tuple read from the top,
/// none as unit.
pub fn decompile_code(
    code: &Michelson,
    inputs: &[(String, Datatype)],
    options: &DecompileOptions,
) -> Result<SyntaxExp, DecompileError> {
    debug!(inputs = inputs.len(), "decompiling code");
    let mut interp = Interp::new(options);
    let stack: Vec<_> = inputs
        .iter()
        .rev()
        .map(|(name, ty)| interp.input(name, ty))
        .collect();
    let exit = interp.block(code, stack.clone())?;
    let graph = interp.finish(stack, exit);
    debug!(nodes = graph.len(), "decompiled code");
    Ok(reconstruct::reconstruct(&graph, options))
}

/// Decompile a packaged contract, including the contracts it originates.
pub fn decompile_contract(
    contract: &MicContract<Michelson>,
) -> Result<ContractCode<(), Syntax>, DecompileError> {
    decompile_contract_with(contract, &DecompileOptions::default())
}

pub fn decompile_contract_with(
    contract: &MicContract<Michelson>,
    options: &DecompileOptions,
) -> Result<ContractCode<(), Syntax>, DecompileError> {
    debug!(parameter = %contract.parameter, storage = %contract.storage, "decompiling contract");
    let mut interp = Interp::new(options);
    let parameter = interp.input("parameter", &contract.parameter);
    let storage = interp.input("storage", &contract.storage);
    let pair = interp.pair(parameter, storage);
    let exit = interp.block(&contract.code, vec![pair])?;
    let graph = interp.finish(vec![pair], exit);
    debug!(nodes = graph.len(), "decompiled contract");
    Ok(ContractCode {
        parameter: contract.parameter.clone(),
        storage: contract.storage.clone(),
        code: reconstruct::reconstruct(&graph, options),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use liquidity_michelson::Instr;

    #[test]
    fn options_default_to_all_on() {
        let opts: DecompileOptions = serde_json::from_str("{\"match_nat\": false}").unwrap();
        assert!(opts.fold_comparisons && opts.fold_pairs && opts.use_annotations);
        assert!(!opts.match_nat);
    }

    #[test]
    fn errors_carry_their_location() {
        let code = Michelson::seq(vec![Michelson::at(Location::new("c.tz"), Instr::Swap)]);
        let err = decompile_code(&code, &[], &DecompileOptions::default()).unwrap_err();
        assert_eq!(err.location(), &Location::new("c.tz"));
        let diag = err.to_diagnostic();
        assert_eq!(diag.category, Category::Decompile);
        assert!(diag.message.contains("SWAP"));

        let located = LocatedError::from(err.clone());
        assert_eq!(located.location, Location::new("c.tz"));
        let wrapped = DiagnosticError::from(err);
        assert_eq!(wrapped.diagnostics()[0].category, Category::Decompile);
    }
}
