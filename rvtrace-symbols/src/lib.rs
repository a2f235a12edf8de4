//! Symbol index (C1): maps a kernel or userspace function name to its entry
//! PC, exit PCs, first-CSR-write PC, and ABI argument/return registers.
//!
//! Built once at startup by parsing an objdump disassembly listing; immutable
//! after construction.

use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("function `{0}` not found in objdump")]
    NotFound(String),
    #[error("csr write to `{1}` not found in function `{0}`")]
    CsrWriteNotFound(String, String),
    #[error("argument index {0} is out of range (RISC-V passes at most 8 arguments in registers)")]
    InvalidArgument(usize),
    #[error("malformed objdump line: {0:?}")]
    MalformedLine(String),
}

/// One disassembled instruction line: `<addr>: <hex> <mnemonic> <operands>`.
#[derive(Debug, Clone)]
struct InsnLine {
    addr: u64,
    mnemonic: String,
    operands: String,
}

struct FunctionBody {
    entry: u64,
    end: u64,
    lines: Vec<InsnLine>,
}

/// Parsed objdump disassembly for one binary (kernel or a userspace program).
pub struct SymbolIndex {
    functions: FxHashMap<String, FunctionBody>,
}

impl SymbolIndex {
    /// Parse an objdump `-d` text listing.
    pub fn parse(text: &str) -> Result<Self, SymbolError> {
        let mut functions = FxHashMap::default();

        let mut current: Option<(String, u64, Vec<InsnLine>)> = None;

        for line in text.lines() {
            let words: Vec<&str> = line.split_whitespace().collect();

            if words.is_empty() {
                if let Some((name, entry, lines)) = current.take() {
                    let end = lines.last().map(|l| l.addr).unwrap_or(entry);
                    functions.insert(name, FunctionBody { entry, end, lines });
                }
                continue;
            }

            if words.len() == 2 && words[1].ends_with(">:") && words[1].starts_with('<') {
                if let Some((name, entry, lines)) = current.take() {
                    let end = lines.last().map(|l| l.addr).unwrap_or(entry);
                    functions.insert(name, FunctionBody { entry, end, lines });
                }
                let name = words[1][1..words[1].len() - 2].to_string();
                let entry = parse_hex_addr(words[0])?;
                current = Some((name, entry, Vec::new()));
                continue;
            }

            if let Some((_, _, lines)) = current.as_mut() {
                if let Some(insn) = parse_insn_line(&words) {
                    lines.push(insn);
                }
            }
        }
        if let Some((name, entry, lines)) = current.take() {
            let end = lines.last().map(|l| l.addr).unwrap_or(entry);
            functions.insert(name, FunctionBody { entry, end, lines });
        }

        Ok(SymbolIndex { functions })
    }

    fn body(&self, name: &str) -> Result<&FunctionBody, SymbolError> {
        self.functions
            .get(name)
            .ok_or_else(|| SymbolError::NotFound(name.to_string()))
    }

    /// The disassembled lines of `name`, one per instruction.
    pub fn function_body(&self, name: &str) -> Result<Vec<String>, SymbolError> {
        let body = self.body(name)?;
        Ok(body
            .lines
            .iter()
            .map(|l| format!("{:x}: {} {}", l.addr, l.mnemonic, l.operands))
            .collect())
    }

    pub fn entry_pc(&self, name: &str) -> Result<u64, SymbolError> {
        Ok(self.body(name)?.entry)
    }

    pub fn end_pc(&self, name: &str) -> Result<u64, SymbolError> {
        Ok(self.body(name)?.end)
    }

    /// All `ret` sites in the function, in program order.
    pub fn exit_pcs(&self, name: &str) -> Result<Vec<u64>, SymbolError> {
        let body = self.body(name)?;
        Ok(body
            .lines
            .iter()
            .filter(|l| l.mnemonic == "ret")
            .map(|l| l.addr)
            .collect())
    }

    /// The PC of the first `csrw` (or synonym) writing `csr_name`.
    pub fn csr_write_pc(&self, name: &str, csr_name: &str) -> Result<u64, SymbolError> {
        let body = self.body(name)?;
        for l in &body.lines {
            if !is_csr_write_mnemonic(&l.mnemonic) {
                continue;
            }
            let target = l.operands.split(',').next().unwrap_or("").trim();
            if target == csr_name {
                return Ok(l.addr);
            }
        }
        Err(SymbolError::CsrWriteNotFound(
            name.to_string(),
            csr_name.to_string(),
        ))
    }

    /// The ABI register carrying argument `i` (0-based) at function entry.
    pub fn arg_reg(&self, name: &str, i: usize) -> Result<String, SymbolError> {
        if i > 7 {
            return Err(SymbolError::InvalidArgument(i));
        }
        let body = self.body(name)?;
        let canonical = format!("a{i}");
        for l in &body.lines {
            if !uses_register(&l.operands, &canonical) {
                continue;
            }
            if l.mnemonic == "mv" {
                if let Some((dst, src)) = split_mv_operands(&l.operands) {
                    if dst == canonical {
                        // `mv a{i}, rs`: a{i} is overwritten from rs.
                        return Ok(src);
                    }
                    // `mv rd, a{i}`: a{i} is only read; it still holds the argument.
                    return Ok(canonical);
                }
            }
            return Ok(canonical);
        }
        Ok(canonical)
    }

    /// The ABI register carrying the return value, resolved symmetrically
    /// to [`SymbolIndex::arg_reg`] but scanning from the end of the function.
    pub fn ret_reg(&self, name: &str) -> Result<String, SymbolError> {
        let body = self.body(name)?;
        let canonical = "a0".to_string();
        for l in body.lines.iter().rev() {
            if !uses_register(&l.operands, &canonical) {
                continue;
            }
            if l.mnemonic == "mv" {
                if let Some((dst, src)) = split_mv_operands(&l.operands) {
                    if dst == canonical {
                        return Ok(src);
                    }
                    return Ok(canonical);
                }
            }
            return Ok(canonical);
        }
        Ok(canonical)
    }
}

fn parse_insn_line(words: &[&str]) -> Option<InsnLine> {
    if words.len() < 3 {
        return None;
    }
    let addr = parse_hex_addr(words[0]).ok()?;
    // words[1] is the raw instruction encoding (hex digits); mnemonic follows.
    let mnemonic = words[2].to_string();
    let operands = words.get(3..).map(|rest| rest.join(" ")).unwrap_or_default();
    Some(InsnLine {
        addr,
        mnemonic,
        operands,
    })
}

fn parse_hex_addr(token: &str) -> Result<u64, SymbolError> {
    let trimmed = token.trim_end_matches(':').trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).map_err(|_| SymbolError::MalformedLine(token.to_string()))
}

fn is_csr_write_mnemonic(mnemonic: &str) -> bool {
    matches!(mnemonic, "csrw" | "csrwi" | "csrrw" | "csrrwi")
}

/// Whether `operands` (a comma-separated operand list, possibly with
/// trailing immediates) references `reg` as a whole token.
fn uses_register(operands: &str, reg: &str) -> bool {
    operands
        .split(|c: char| c == ',' || c.is_whitespace())
        .any(|tok| tok == reg)
}

fn split_mv_operands(operands: &str) -> Option<(String, String)> {
    let mut parts = operands.splitn(2, ',');
    let dst = parts.next()?.trim().to_string();
    let src = parts.next()?.trim().to_string();
    Some((dst, src))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
ffffffff80140000 <do_execveat_common.isra.0>:\n\
ffffffff80140000: 1141       addi sp,sp,-16\n\
ffffffff80140002: e406       sd   ra,8(sp)\n\
ffffffff80140004: 852e       mv   a0,a1\n\
ffffffff80140006: 8082       ret\n\
\n\
ffffffff80150000 <set_mm_asid>:\n\
ffffffff80150000: 1141       addi sp,sp,-16\n\
ffffffff80150002: 10579073   csrw satp,a5\n\
ffffffff80150006: 8082       ret\n";

    #[test]
    fn parses_entry_and_exit() {
        let idx = SymbolIndex::parse(DUMP).unwrap();
        assert_eq!(idx.entry_pc("do_execveat_common.isra.0").unwrap(), 0xffffffff80140000);
        assert_eq!(
            idx.exit_pcs("do_execveat_common.isra.0").unwrap(),
            vec![0xffffffff80140006]
        );
    }

    #[test]
    fn finds_csr_write() {
        let idx = SymbolIndex::parse(DUMP).unwrap();
        assert_eq!(
            idx.csr_write_pc("set_mm_asid", "satp").unwrap(),
            0xffffffff80150002
        );
    }

    #[test]
    fn resolves_arg_reg_through_mv() {
        let idx = SymbolIndex::parse(DUMP).unwrap();
        // first use of a1 is `mv a0, a1`: a1 is the source of the move and
        // is read directly, so the argument stays in a1.
        assert_eq!(idx.arg_reg("do_execveat_common.isra.0", 1).unwrap(), "a1");
    }

    #[test]
    fn arg_reg_rejects_out_of_range() {
        let idx = SymbolIndex::parse(DUMP).unwrap();
        assert!(matches!(
            idx.arg_reg("do_execveat_common.isra.0", 8),
            Err(SymbolError::InvalidArgument(8))
        ));
    }

    #[test]
    fn missing_function_is_not_found() {
        let idx = SymbolIndex::parse(DUMP).unwrap();
        assert!(matches!(idx.entry_pc("no_such_fn"), Err(SymbolError::NotFound(_))));
    }
}
