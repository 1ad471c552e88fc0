pub mod span {
    use serde::Serialize;

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
    pub struct Span {
        pub start: u32,
        pub end: u32,
    }

    impl Span {
        pub fn new(start: u32, end: u32) -> Self {
            Self { start, end }
        }
    }

    impl std::fmt::Display for Span {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

pub mod ty {
    use serde::Serialize;

    /// Static result type the binder assigns to an IR node.
    ///
    /// `Object` and `Array` only appear as the declared type of dynamic
    /// (document-backed) values; a formula value wrapping one of those has
    /// the static type `Untyped`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
    pub enum FormulaType {
        Blank,
        Boolean,
        Number,
        Decimal,
        String,
        DateTime,
        Object,
        Array,
        Untyped,
        Lambda,
        Error,
    }

    impl FormulaType {
        pub fn name(self) -> &'static str {
            match self {
                FormulaType::Blank => "Blank",
                FormulaType::Boolean => "Boolean",
                FormulaType::Number => "Number",
                FormulaType::Decimal => "Decimal",
                FormulaType::String => "String",
                FormulaType::DateTime => "DateTime",
                FormulaType::Object => "Object",
                FormulaType::Array => "Array",
                FormulaType::Untyped => "Untyped",
                FormulaType::Lambda => "Lambda",
                FormulaType::Error => "Error",
            }
        }

        /// Parse a type name as written on the command line (case-insensitive).
        pub fn from_name(name: &str) -> Option<FormulaType> {
            let ty = match name.to_ascii_lowercase().as_str() {
                "blank" => FormulaType::Blank,
                "boolean" | "bool" => FormulaType::Boolean,
                "number" | "float" => FormulaType::Number,
                "decimal" => FormulaType::Decimal,
                "string" | "text" => FormulaType::String,
                "datetime" => FormulaType::DateTime,
                "object" => FormulaType::Object,
                "array" => FormulaType::Array,
                "untyped" => FormulaType::Untyped,
                "lambda" => FormulaType::Lambda,
                "error" => FormulaType::Error,
                _ => return None,
            };
            Some(ty)
        }
    }

    impl std::fmt::Display for FormulaType {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.name())
        }
    }
}

pub mod ir {
    use super::span::Span;
    use super::ty::FormulaType;
    use serde::Serialize;

    /// What the binder knows about one call node: its result type and
    /// where it came from.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
    pub struct IrContext {
        pub result_type: FormulaType,
        pub span: Span,
    }

    impl IrContext {
        pub fn new(result_type: FormulaType, span: Span) -> Self {
            Self { result_type, span }
        }
    }

    /// Handle to a lambda sub-expression owned by the evaluator.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
    pub struct LambdaId(pub u32);

    impl std::fmt::Display for LambdaId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "λ{}", self.0)
        }
    }
}
