//! Invocation source synthesis.
//!
//! [`generate`] binds caller parameters against a descriptor and renders a
//! small, self-contained Rust program that performs the invocation. The
//! program has three fixed sections: acquire the callable from the catalogue,
//! invoke it under `catch_unwind`, print a success or failure summary. Only
//! the function name and the bound literal values are interpolated, so the
//! output depends on nothing but the descriptor and the parameters.

use crate::catalogue::{Arguments, FunctionDescriptor};
use crate::error::InvocationError;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write;

/// Source text plus the structured binding it was rendered from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedArtifact {
    function_name: String,
    source_text: String,
    /// Bound parameters in declaration order.
    parameters: Vec<(String, Value)>,
}

impl GeneratedArtifact {
    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    pub fn parameters(&self) -> &[(String, Value)] {
        &self.parameters
    }

    /// The bound parameters as an argument map.
    pub fn arguments(&self) -> Arguments {
        self.parameters.iter().cloned().collect()
    }
}

/// Bind `params` to `descriptor` and render the invocation source.
///
/// Declared parameters that are absent get no value, leaving the callable's
/// default in force. Any supplied key the descriptor does not declare fails
/// the whole binding.
pub fn generate(
    descriptor: &FunctionDescriptor,
    params: &Arguments,
) -> Result<GeneratedArtifact, InvocationError> {
    let unknown: Vec<String> = params
        .keys()
        .filter(|key| !descriptor.declares(key))
        .cloned()
        .collect();

    if !unknown.is_empty() {
        return Err(InvocationError::ParameterMismatch {
            function: descriptor.name.clone(),
            unknown,
        });
    }

    let parameters: Vec<(String, Value)> = descriptor
        .parameters
        .iter()
        .filter_map(|name| params.get(name).map(|v| (name.clone(), v.clone())))
        .collect();

    let source_text = render(&descriptor.name, &parameters);

    Ok(GeneratedArtifact {
        function_name: descriptor.name.clone(),
        source_text,
        parameters,
    })
}

fn render(function_name: &str, parameters: &[(String, Value)]) -> String {
    let mut src = String::new();

    // Writing into a String is infallible.
    let _ = writeln!(src, "// Invocation of `{}`.", function_name);
    src.push_str("use actuator::catalogue::{Arguments, Catalogue, InvocationContext};\n\n");
    src.push_str("fn main() {\n");

    let _ = writeln!(src, "    // Acquire");
    src.push_str("    let catalogue = Catalogue::builtin();\n");
    let _ = writeln!(
        src,
        "    let Some(function) = catalogue.function({:?}) else {{",
        function_name
    );
    let _ = writeln!(
        src,
        "        eprintln!(\"Function `{{}}` not found in registry\", {:?});",
        function_name
    );
    src.push_str("        std::process::exit(1);\n");
    src.push_str("    };\n\n");

    let _ = writeln!(src, "    // Invoke");
    if parameters.is_empty() {
        src.push_str("    let arguments = Arguments::new();\n");
    } else {
        src.push_str("    let mut arguments = Arguments::new();\n");
        for (name, value) in parameters {
            let _ = writeln!(
                src,
                "    arguments.insert({:?}.to_string(), serde_json::from_str({:?}).unwrap());",
                name,
                value.to_string()
            );
        }
    }
    src.push_str("    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {\n");
    src.push_str("        function.invoke(&arguments, &InvocationContext::detached())\n");
    src.push_str("    }));\n\n");

    let _ = writeln!(src, "    // Report");
    src.push_str("    match outcome {\n");
    src.push_str("        Ok(Ok(result)) => {\n");
    src.push_str("            println!(\"Function executed successfully.\");\n");
    src.push_str("            println!(\"Result: {}\", result);\n");
    src.push_str("        }\n");
    src.push_str("        Ok(Err(fault)) => eprintln!(\"Error executing function: {}\", fault),\n");
    src.push_str("        Err(_) => eprintln!(\"Error executing function: panicked\"),\n");
    src.push_str("    }\n");
    src.push_str("}\n");

    src
}
