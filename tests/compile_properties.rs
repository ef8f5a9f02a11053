//! Property tests for the compiler

use mdflow::compiler::ast::normalize_generated_ids;
use mdflow::compiler::{DiagnosticKind, DirectiveTable, Level, compile};
use proptest::prelude::*;

/// Small documents mixing prose, references and well-formed directives.
fn document() -> impl Strategy<Value = String> {
    let block = prop_oneof![
        "[A-Za-z ]{1,20}".prop_map(|text| format!("{}\n\n", text.trim_end())),
        "[a-z]{1,8}".prop_map(|name| format!("{{% set #{} value=\"{}\" /%}}\n", name, name)),
        (1usize..4).prop_map(|n| format!("{{% loop count={} %}}\nbody $x\n{{% /loop %}}\n", n)),
        Just("{% if true %}\nyes\n{% else /%}\nno\n{% /if %}\n".to_string()),
        Just("```python\nprint('{% not a tag %}')\n```\n".to_string()),
    ];
    prop::collection::vec(block, 0..8).prop_map(|blocks| blocks.concat())
}

proptest! {
    #[test]
    fn prop_compile_is_deterministic(src in document()) {
        let table = DirectiveTable::builtin();
        let first = compile(&src, &table);
        let second = compile(&src, &table);

        let mut left = first.document.blocks.clone();
        let mut right = second.document.blocks.clone();
        normalize_generated_ids(&mut left);
        normalize_generated_ids(&mut right);
        prop_assert_eq!(left, right);
        prop_assert_eq!(first.errors.len(), second.errors.len());
        prop_assert_eq!(first.warnings.len(), second.warnings.len());
    }

    #[test]
    fn prop_diagnostics_stay_inside_source(src in "[a-z {}%$#=\"/\n.\\[\\]]{0,120}") {
        let output = compile(&src, &DirectiveTable::builtin());
        for diagnostic in output.diagnostics() {
            prop_assert!(diagnostic.span.start <= diagnostic.span.end);
            prop_assert!(diagnostic.span.end <= src.len());
        }
        for error in &output.errors {
            prop_assert_eq!(error.level, Level::Error);
        }
    }

    #[test]
    fn prop_fenced_tags_are_not_directives(body in "[a-z ]{0,20}") {
        let src = format!("```\n{{% loop %}}{}\n```\n", body);
        let output = compile(&src, &DirectiveTable::builtin());
        prop_assert!(output.errors.is_empty());
        prop_assert!(output.document.blocks.iter().all(|block| block.tag_name().is_none()));
    }
}

#[test]
fn test_unknown_directive_is_a_warning() {
    let output = compile("{% chart /%}\n", &DirectiveTable::builtin());
    assert!(!output.has_errors());
    assert_eq!(output.warnings.len(), 1);
    assert_eq!(output.warnings[0].kind, DiagnosticKind::UnknownDirective);
}

#[test]
fn test_mismatched_close_reports_position() {
    let src = "intro\n{% loop count=1 %}\nx\n{% /if %}\n";
    let output = compile(src, &DirectiveTable::builtin());
    let mismatch = output
        .errors
        .iter()
        .find(|d| d.kind == DiagnosticKind::MismatchedTag)
        .unwrap();
    assert_eq!(mismatch.line_col(src), (4, 1));
}

#[test]
fn test_undefined_variable_warns() {
    let output = compile("Hello $nobody\n", &DirectiveTable::builtin());
    assert!(
        output
            .warnings
            .iter()
            .any(|d| d.kind == DiagnosticKind::UndefinedVariable)
    );
}
