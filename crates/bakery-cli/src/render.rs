use std::fmt::Write;

use bakery_core::command::Command;
use bakery_core::engine::BuildSummary;

/// Indented rendering of a compiled tree, one node per line.
///
/// Blank lines and comments are left out.
pub fn tree(cmds: &[Command]) -> String {
    let mut out = String::new();
    write_nodes(&mut out, cmds, 0);
    out
}

fn write_nodes(out: &mut String, cmds: &[Command], indent: usize) {
    for cmd in cmds.iter().filter(|c| !c.is_noop()) {
        let _ = writeln!(out, "{:width$}{}", "", cmd, width = indent * 2);
        if let Some(body) = &cmd.body {
            write_nodes(out, body, indent + 1);
        }
    }
}

/// Opcode and operands of a single tokenized line.
pub fn command_fields(cmd: &Command) -> String {
    let kind = if cmd.is_external() { "macro" } else { "builtin" };
    let mut out = format!("opcode: {} ({})\n", cmd.opcode, kind);
    for (idx, operand) in cmd.operands.iter().enumerate() {
        let _ = writeln!(out, "  #{}: {}", idx + 1, operand);
    }
    out
}

pub fn summary(summary: &BuildSummary) -> String {
    format!(
        "Build {}: {} script(s), {} error(s), {} warning(s)",
        summary.build_id, summary.scripts, summary.errors, summary.warnings
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bakery_core::command::SectionAddress;
    use bakery_core::compiler::compile_section;
    use bakery_core::tokenizer::tokenize_line;

    #[test]
    fn test_tree_indents_bodies() {
        let lines: Vec<String> = ["If,%A%,Equal,B,Begin", "Echo,x", "", "End", "Else,Echo,y"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let address = SectionAddress::new("t.script", "Process", lines.len());
        let text = tree(&compile_section(&lines, &address).unwrap());
        assert_eq!(text, "IfCompact,Equal,%A%,B\n  Echo,x\nElseCompact\n  Echo,y\n");
    }

    #[test]
    fn test_command_fields() {
        let text = command_fields(&tokenize_line("Echo,\"a,b\",c").unwrap());
        assert_eq!(text, "opcode: Echo (builtin)\n  #1: a,b\n  #2: c\n");

        let text = command_fields(&tokenize_line("Shout,x").unwrap());
        assert!(text.starts_with("opcode: Shout (macro)"));
    }
}
