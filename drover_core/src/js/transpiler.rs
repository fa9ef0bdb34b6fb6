//! Source preprocessing for the compatibility modes: `extended` normalizes
//! modern JavaScript through the swc pipeline, `experimental_enhanced`
//! additionally strips TypeScript type annotations.

use crate::prelude::*;

use anyhow::bail;
use swc_common::errors::ColorConfig;
use swc_common::errors::Handler;
use swc_common::sync::Lrc;
use swc_common::FileName;
use swc_common::Globals;
use swc_common::Mark;
use swc_common::SourceMap;
use swc_common::GLOBALS;
use swc_ecma_ast::EsVersion;
use swc_ecma_codegen::text_writer::JsWriter;
use swc_ecma_codegen::Emitter;
use swc_ecma_parser::lexer::Lexer;
use swc_ecma_parser::EsSyntax;
use swc_ecma_parser::Parser;
use swc_ecma_parser::StringInput;
use swc_ecma_parser::Syntax;
use swc_ecma_parser::TsSyntax;
use swc_ecma_transforms_base::fixer::fixer;
use swc_ecma_transforms_base::hygiene::hygiene;
use swc_ecma_transforms_base::resolver;
use swc_ecma_transforms_typescript::strip;

/// Runs plain JavaScript through parse → transform → codegen, surfacing
/// syntax errors early with the script's own file name attached.
pub fn normalize_es(filename: Option<&str>, source: &str) -> AnyResult<String> {
  let syntax = Syntax::Es(EsSyntax {
    jsx: false,
    decorators: false,
    ..Default::default()
  });
  compile(filename, source, syntax, false)
}

/// Compiles TypeScript (or JS with type annotations) down to JavaScript.
pub fn strip_types(filename: Option<&str>, source: &str) -> AnyResult<String> {
  let syntax = Syntax::Typescript(TsSyntax {
    tsx: false,
    decorators: true,
    no_early_errors: true,
    ..Default::default()
  });
  compile(filename, source, syntax, true)
}

fn compile(
  filename: Option<&str>,
  source: &str,
  syntax: Syntax,
  strip_ts: bool,
) -> AnyResult<String> {
  let globals = Globals::default();
  let cm: Lrc<SourceMap> = Default::default();
  let handler =
    Handler::with_tty_emitter(ColorConfig::Never, true, false, Some(cm.clone()));

  let filename = match filename {
    Some(filename) => FileName::Custom(filename.into()),
    None => FileName::Anon,
  };

  let fm = cm.new_source_file(filename.into(), source.into());

  let lexer = Lexer::new(
    syntax,
    // The interpreter accepts everything the latest ES edition defines.
    EsVersion::EsNext,
    StringInput::from(&*fm),
    None,
  );

  let mut parser = Parser::new_from(lexer);

  let program = match parser
    .parse_program()
    .map_err(|e| e.into_diagnostic(&handler).emit())
  {
    Ok(module) => module,
    Err(_) => bail!("script compilation failed"),
  };

  let mut buffer = vec![];

  GLOBALS.set(&globals, || {
    let program = if strip_ts {
      program
        .apply(&mut resolver(Mark::new(), Mark::new(), true))
        .apply(&mut strip(Mark::new(), Mark::new()))
        .apply(&mut hygiene())
        .apply(&mut fixer(None))
    } else {
      program
        .apply(&mut resolver(Mark::new(), Mark::new(), false))
        .apply(&mut fixer(None))
    };

    let cfg = swc_ecma_codegen::Config::default().with_target(EsVersion::EsNext);
    let mut emitter = Emitter {
      cfg,
      cm: cm.clone(),
      comments: None,
      wr: JsWriter::new(cm, "\n", &mut buffer, None),
    };

    emitter.emit_program(&program).unwrap();
  });

  Ok(String::from_utf8_lossy(&buffer).to_string())
}

#[cfg(test)]
mod transpiler_tests {
  use super::*;

  #[test]
  fn normalize1() {
    let out = normalize_es(Some("t.js"), "export default function () { return 1 + 2; }")
      .unwrap();
    assert!(out.contains("export default function"));
  }

  #[test]
  fn normalize_syntax_error1() {
    assert!(normalize_es(Some("t.js"), "export default function ( {").is_err());
  }

  #[test]
  fn strip_types1() {
    let out = strip_types(
      Some("t.ts"),
      "export function add(a: number, b: number): number { return a + b; }",
    )
    .unwrap();
    assert!(out.contains("function add(a, b)"));
    assert!(!out.contains("number"));
  }
}
