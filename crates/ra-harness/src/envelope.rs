//! Tool-result envelope replayed into the engine's prompt.
//!
//! ```text
//! <function_results>
//! <result>
//! <function_name>NAME</function_name>
//! <stdout><![CDATA[OUTPUT]]></stdout>
//! </result>
//! </function_results>
//! ```
//!
//! A failed call carries `<error>` instead of `<stdout>`. Existing transcripts
//! depend on these tag names and this nesting.

use ra_core::types::FunctionCallResult;

const CDATA_OPEN: &str = "<![CDATA[";
const CDATA_CLOSE: &str = "]]>";

/// Wrap `text` in a CDATA section. An embedded `]]>` ends the section, emits
/// the `>` in a fresh one and carries on.
pub fn cdata(text: &str) -> String {
    format!(
        "{CDATA_OPEN}{}{CDATA_CLOSE}",
        text.replace(CDATA_CLOSE, "]]]]><![CDATA[>")
    )
}

/// One `<result>` block, without a trailing newline.
pub fn format_result(result: &FunctionCallResult) -> String {
    let body = match (&result.error, &result.stdout) {
        (Some(err), _) => format!("<error>{}</error>", cdata(err)),
        (None, Some(out)) => format!("<stdout>{}</stdout>", cdata(out)),
        (None, None) => format!("<stdout>{}</stdout>", cdata("")),
    };
    format!(
        "<result>\n<function_name>{}</function_name>\n{body}\n</result>",
        result.function_name
    )
}

/// The full envelope for a batch of results. Empty input gives an empty
/// string so callers can skip the block entirely.
pub fn format_function_results(results: &[FunctionCallResult]) -> String {
    if results.is_empty() {
        return String::new();
    }
    let mut out = String::from("<function_results>\n");
    for result in results {
        out.push_str(&format_result(result));
        out.push('\n');
    }
    out.push_str("</function_results>");
    out
}
