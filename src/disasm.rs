//! Prototype listings in the style of `luac -l -l`

use std::fmt::Write;

use crate::proto::{Constant, Prototype};

/// Render `proto` and its nested prototypes as text
pub fn disassemble(proto: &Prototype) -> String {
    let mut out = String::new();
    // writing into a String cannot fail
    let _ = write_proto(&mut out, proto);
    out
}

fn write_proto(out: &mut String, proto: &Prototype) -> std::fmt::Result {
    let kind = if proto.line_defined == 0 { "main" } else { "function" };
    let source = if proto.source.is_empty() { "?" } else { proto.source.as_str() };
    writeln!(
        out,
        "\n{} <{}:{},{}> ({} instructions)",
        kind,
        source,
        proto.line_defined,
        proto.last_line_defined,
        proto.code.len()
    )?;
    writeln!(
        out,
        "{}{} params, {} slots, {} upvalues, {} locals, {} constants, {} functions",
        proto.num_params,
        if proto.is_vararg { "+" } else { "" },
        proto.max_stack_size,
        proto.upvalues.len(),
        proto.local_vars.len(),
        proto.constants.len(),
        proto.protos.len()
    )?;

    for (pc, inst) in proto.code.iter().enumerate() {
        let line = match proto.line_at(pc) {
            0 => "[-]".to_string(),
            n => format!("[{}]", n),
        };
        writeln!(out, "\t{}\t{}\t{}", pc + 1, line, inst)?;
    }

    writeln!(out, "constants ({}):", proto.constants.len())?;
    for (i, k) in proto.constants.iter().enumerate() {
        let text = match k {
            Constant::Nil => "nil".to_string(),
            Constant::Boolean(b) => b.to_string(),
            Constant::Integer(n) => n.to_string(),
            Constant::Float(f) => format!("{:?}", f),
            Constant::String(s) => format!("{:?}", s),
        };
        writeln!(out, "\t{}\t{}", i + 1, text)?;
    }

    writeln!(out, "locals ({}):", proto.local_vars.len())?;
    for (i, var) in proto.local_vars.iter().enumerate() {
        writeln!(out, "\t{}\t{}\t{}\t{}", i, var.name, var.start_pc + 1, var.end_pc + 1)?;
    }

    writeln!(out, "upvalues ({}):", proto.upvalues.len())?;
    for (i, up) in proto.upvalues.iter().enumerate() {
        let name = if up.name.is_empty() { "-" } else { up.name.as_str() };
        writeln!(out, "\t{}\t{}\t{}\t{}", i, name, up.in_stack as u8, up.index)?;
    }

    for child in &proto.protos {
        write_proto(out, child)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Block, Expression, FunctionDef, Statement};
    use crate::config::CompilerConfig;
    use crate::proto::compile;

    #[test]
    fn test_listing_contains_code_and_tables() {
        let block = Block::new(
            vec![Statement::LocalVarDecl {
                names: vec!["x".into()],
                exps: vec![Expression::string("hi")],
                last_line: 1,
            }],
            1,
        );
        let proto = compile(&block, &CompilerConfig::default().with_chunk_name("@t.lua")).unwrap();
        let text = disassemble(&proto);

        assert!(text.contains("main <@t.lua:0,1> (2 instructions)"));
        assert!(text.contains("0+ params, 2 slots, 1 upvalues, 1 locals, 1 constants, 0 functions"));
        assert!(text.contains("\t1\t[1]\tLOADK     0 -1"));
        assert!(text.contains("\t1\t\"hi\""));
        assert!(text.contains("\t0\tx\t2\t3"));
        assert!(text.contains("\t0\t_ENV\t1\t0"));
    }

    #[test]
    fn test_listing_recurses_into_functions() {
        let def = FunctionDef {
            params: vec![],
            is_vararg: false,
            block: Block::new(vec![], 3),
            line: 2,
            last_line: 3,
        };
        let block = Block::new(
            vec![Statement::LocalFunctionDef { name: "f".into(), function: def }],
            3,
        );
        let proto = compile(&block, &CompilerConfig::default()).unwrap();
        let text = disassemble(&proto);
        assert!(text.contains("function <?:2,3> (1 instructions)"));
        assert!(text.contains("CLOSURE   0 0"));
    }
}
