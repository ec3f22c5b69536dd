include!("context.rs");
include!("pipeline.rs");
include!("source_parse.rs");
include!("include_graph.rs");
include!("defs_resolver.rs");
include!("type_expr.rs");
include!("json_symbols.rs");
include!("sanitize.rs");
include!("script_compile.rs");
include!("xml_utils.rs");
include!("macro_expand.rs");
include!("defaults.rs");
