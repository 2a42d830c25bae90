//! A small `formatString`-style helper (original `mem.h`), centralized so
//! the `ASSERT_TYPE` two-`%s` error message template isn't rebuilt with ad
//! hoc `format!` call sites scattered across the compiler and VM.

/// Replaces, in order, each `%s` in `template` with the corresponding
/// entry of `args`. Extra `%s` beyond `args.len()` are left verbatim;
/// extra `args` are ignored.
pub fn format_brace_message(template: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut arg_iter = args.iter();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' && chars.peek() == Some(&'s') {
            chars.next();
            if let Some(arg) = arg_iter.next() {
                out.push_str(arg);
            } else {
                out.push_str("%s");
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_both_slots() {
        let msg = format_brace_message("Expected value of type %s, got %s.", &["Num", "Str"]);
        assert_eq!(msg, "Expected value of type Num, got Str.");
    }

    #[test]
    fn leaves_unmatched_placeholder_alone() {
        let msg = format_brace_message("only %s here", &[]);
        assert_eq!(msg, "only %s here");
    }
}
