use serde_sarif::sarif::{
    ArtifactLocation, Location, LogicalLocation, Message, MultiformatMessageString,
    PhysicalLocation, Region, ReportingDescriptor, Result as SarifResult,
};

use crate::ast::TranslationUnit;
use crate::diagnose::{Diagnostic, DiagnosticContext, ErrorCode};

/// SARIF rule descriptor for the nullability checks.
pub fn rule_descriptor() -> ReportingDescriptor {
    ReportingDescriptor::builder()
        .id("NULLABILITY")
        .name("Pointer nullability checks")
        .short_description(
            MultiformatMessageString::builder()
                .text("Flow-sensitive pointer nullability violations")
                .build(),
        )
        .build()
}

/// Renders engine diagnostics as SARIF results.
pub fn diagnostics_to_sarif(tu: &TranslationUnit, diagnostics: &[Diagnostic]) -> Vec<SarifResult> {
    diagnostics
        .iter()
        .map(|diagnostic| {
            let message = Message::builder().text(message_text(diagnostic)).build();
            SarifResult::builder()
                .rule_id("NULLABILITY")
                .message(message)
                .locations(vec![diagnostic_location(tu, diagnostic)])
                .build()
        })
        .collect()
}

fn message_text(diagnostic: &Diagnostic) -> String {
    let what = match diagnostic.code {
        ErrorCode::ExpectedNonNull => "expected a non-null value",
        ErrorCode::Untracked => "value is not modeled and may be null",
        ErrorCode::AssertFailed => "nullability assertion failed",
    };
    let context = match diagnostic.context {
        DiagnosticContext::NullableDereference => "dereference",
        DiagnosticContext::FunctionArgument => "function argument",
        DiagnosticContext::ReturnValue => "return value",
        DiagnosticContext::Initializer => "initializer",
        DiagnosticContext::Other => "expression",
    };
    match &diagnostic.param_name {
        Some(param) => format!("Nullability: {what} in {context} (parameter '{param}')"),
        None => format!("Nullability: {what} in {context}"),
    }
}

fn diagnostic_location(tu: &TranslationUnit, diagnostic: &Diagnostic) -> Location {
    let file = tu.file(diagnostic.range.file);
    let logical = LogicalLocation::builder()
        .name(file.name.clone())
        .kind("member")
        .build();
    let artifact_location = ArtifactLocation::builder().uri(file.name.clone()).build();
    let region = Region::builder()
        .start_line(i64::from(diagnostic.range.start_line))
        .end_line(i64::from(diagnostic.range.end_line))
        .build();
    let physical = PhysicalLocation::builder()
        .artifact_location(artifact_location)
        .region(region)
        .build();
    Location::builder()
        .logical_locations(vec![logical])
        .physical_location(physical)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nullability::NullabilityKind;
    use crate::testing::TuBuilder;
    use crate::Type;

    #[test]
    fn sarif_results_carry_rule_id_and_location() {
        let mut tu = TuBuilder::new();
        let f = tu.func(
            "f",
            Type::Void,
            vec![(
                "p",
                Type::annotated_pointer(Type::Int, NullabilityKind::Nullable),
            )],
        );
        let mut b = tu.body(&f);
        let p = b.param_value(&f, 0);
        b.deref(p);
        b.ret(None);
        b.finish();
        let tu = tu.build();

        let diagnostics = crate::diagnose::diagnose_translation_unit(&tu).expect("diagnose");
        assert_eq!(diagnostics.len(), 1);
        let results = diagnostics_to_sarif(&tu, &diagnostics);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rule_id.as_deref(), Some("NULLABILITY"));
        let message = results[0].message.text.as_deref().unwrap_or("");
        assert!(message.contains("expected a non-null value"));
        assert!(message.contains("dereference"));
    }

    #[test]
    fn parameter_names_appear_in_messages() {
        let mut tu = TuBuilder::new();
        let callee = tu.func(
            "callee",
            Type::Void,
            vec![(
                "target",
                Type::annotated_pointer(Type::Int, NullabilityKind::NonNull),
            )],
        );
        let caller = tu.func(
            "caller",
            Type::Void,
            vec![(
                "p",
                Type::annotated_pointer(Type::Int, NullabilityKind::Nullable),
            )],
        );
        let mut b = tu.body(&caller);
        let p = b.param_value(&caller, 0);
        b.call(&callee, vec![p]);
        b.ret(None);
        b.finish();
        let tu = tu.build();

        let diagnostics = crate::diagnose::diagnose_translation_unit(&tu).expect("diagnose");
        let results = diagnostics_to_sarif(&tu, &diagnostics);
        assert_eq!(results.len(), 1);
        let message = results[0].message.text.as_deref().unwrap_or("");
        assert!(message.contains("parameter 'target'"), "{message}");
    }

    #[test]
    fn descriptor_is_well_formed() {
        let descriptor = rule_descriptor();
        assert_eq!(descriptor.id, "NULLABILITY");
        assert!(descriptor.short_description.is_some());
    }
}
