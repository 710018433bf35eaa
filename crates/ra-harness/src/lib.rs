//! Collaborators the iteration loop drives: the reasoning engine, the
//! registry of callable functions and the result envelope fed back into the
//! next prompt.

pub mod builtin_functions;
pub mod envelope;
pub mod functions;
pub mod provider;
