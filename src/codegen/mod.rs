// Module-level code generation and linking. A validated module is optionally run
// through the inliner, then its data items, string literals and imports are given
// addresses, every function is lowered into one shared encoder, and the finished code
// is copied into a single executable mapping. Data blocks, symbol names and the link
// and frame tables are all drawn from the context allocator; bss is zeroed and scalar
// globals get their constant initializer.
// Imports resolve through the caller's resolver, which tries host symbols, earlier
// modules and the dynamic linker in that order. Reference cells, addresses stored inside
// data items and globals pointing at functions can only be filled once the code is
// placed, so they are patched last.
// Nothing is handed back until every step has succeeded, so a failed module leaves no
// entry points behind.

//! Lowering and linking of whole modules.

pub mod analysis;
pub mod frame;
pub mod inline;
pub mod lower;
pub mod magic;
pub mod regcache;

use crate::core::alloc::{AllocStr, ContextAlloc};
use crate::core::error::{CompileError, CompileResult};
use crate::core::options::ActiveOpts;
use crate::core::session::{CompilationSession, SessionStats, StatEvent};
use crate::ir::{ir_vec, validate_module, IrVec, ItemId, ItemKind, Module, Operand, Type};
use crate::x64::{ExecBuffer, X64Encoder};
use hashbrown::DefaultHashBuilder;
use lower::{FunctionLowering, LinkTable};
use std::alloc::Layout;
use std::ptr::NonNull;

/// Symbol table keyed by name, stored in context memory.
pub type SymbolTable = hashbrown::HashMap<AllocStr, Symbol, DefaultHashBuilder, ContextAlloc>;

/// Resolver for names a module imports.
pub type SymbolResolver<'r> = dyn Fn(&str) -> Option<u64> + 'r;

/// Address of a named item after linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub addr: u64,
    pub is_func: bool,
}

/// Data storage of one item, released through the context allocator.
pub struct DataBlock {
    ptr: NonNull<u8>,
    layout: Layout,
    alloc: ContextAlloc,
}

// SAFETY: the block is owned exclusively and only written before the module is handed
// out, so it may move between threads with its context.
unsafe impl Send for DataBlock {}

impl DataBlock {
    fn new(alloc: &ContextAlloc, size: u64, align: u64) -> CompileResult<Self> {
        let layout = usize::try_from(size.max(1))
            .ok()
            .and_then(|s| Layout::from_size_align(s, align.clamp(1, 4096) as usize).ok())
            .ok_or_else(|| CompileError::internal(format!("data block of {size} bytes with align {align}")))?;
        let ptr = alloc.alloc_bytes(layout, true);
        Ok(Self {
            ptr,
            layout,
            alloc: alloc.clone(),
        })
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    fn write(&mut self, off: usize, bytes: &[u8]) -> CompileResult<()> {
        if off + bytes.len() > self.layout.size() {
            return Err(CompileError::internal("initializer larger than its data item"));
        }
        // SAFETY: the range was checked against the block size above.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(off), bytes.len()) };
        Ok(())
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `alloc` with exactly this layout.
        unsafe { self.alloc.free_bytes(self.ptr, self.layout) };
    }
}

impl std::fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataBlock({:#x}, {} bytes)", self.addr(), self.len())
    }
}

/// Native code and data of one linked module.
#[derive(Debug)]
pub struct GeneratedModule {
    pub name: AllocStr,
    code: Option<ExecBuffer>,
    data: IrVec<DataBlock>,
    pub symbols: SymbolTable,
}

impl GeneratedModule {
    /// Address of the function `name`.
    pub fn function(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).filter(|s| s.is_func).map(|s| s.addr)
    }

    /// Address of any function or data item called `name`.
    pub fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).map(|s| s.addr)
    }

    pub fn code_size(&self) -> usize {
        self.code.as_ref().map_or(0, ExecBuffer::len)
    }

    pub fn data_size(&self) -> usize {
        self.data.iter().map(DataBlock::len).sum()
    }

    /// Whether `addr` points into this module's code.
    pub fn contains_code(&self, addr: u64) -> bool {
        self.code.as_ref().is_some_and(|c| c.contains(addr as usize))
    }
}

/// Encode `value` in the 80-bit x87 extended format.
pub fn f64_to_x87(value: f64) -> [u8; 10] {
    let bits = value.to_bits();
    let sign = ((bits >> 63) as u16) << 15;
    let exp = ((bits >> 52) & 0x7ff) as i32;
    let frac = bits & ((1u64 << 52) - 1);
    let (exp80, mant) = match exp {
        0 if frac == 0 => (0u16, 0u64),
        0 => {
            // Subnormal double: normalize into the wider exponent range.
            let shift = frac.leading_zeros() as i32;
            let mant = frac << shift;
            ((16383 - 1022 - (shift - 11)) as u16, mant)
        }
        0x7ff => (0x7fff, (1u64 << 63) | (frac << 11)),
        _ => ((exp - 1023 + 16383) as u16, (1u64 << 63) | (frac << 11)),
    };
    let mut out = [0u8; 10];
    out[..8].copy_from_slice(&mant.to_le_bytes());
    out[8..].copy_from_slice(&(sign | exp80).to_le_bytes());
    out
}

/// Bytes of a scalar constant stored as `ty`, and how many of them are used.
fn scalar_bytes(ty: Type, value: &Operand) -> Option<([u8; 10], usize)> {
    let mut out = [0u8; 10];
    let mut put = |bytes: &[u8]| {
        out[..bytes.len()].copy_from_slice(bytes);
        bytes.len()
    };
    let len = match (ty, *value) {
        (Type::F, Operand::Float(f)) => put(&f.to_le_bytes()),
        (Type::F, Operand::Double(d) | Operand::LDouble(d)) => put(&(d as f32).to_le_bytes()),
        (Type::D, Operand::Double(d) | Operand::LDouble(d)) => put(&d.to_le_bytes()),
        (Type::D, Operand::Float(f)) => put(&f64::from(f).to_le_bytes()),
        (Type::LD, Operand::Double(d) | Operand::LDouble(d)) => put(&f64_to_x87(d)),
        (Type::LD, Operand::Float(f)) => put(&f64_to_x87(f64::from(f))),
        (_, Operand::Int(_) | Operand::Uint(_)) if ty.is_int() => {
            let size = (ty.size() as usize).min(8);
            put(&value.int_imm()?.to_le_bytes()[..size])
        }
        _ => return None,
    };
    Some((out, len))
}

fn storage_of(kind: &ItemKind) -> Option<(u64, u64)> {
    match kind {
        ItemKind::Data { ty, bytes } => Some((bytes.len() as u64, ty.size().clamp(1, 16))),
        ItemKind::Bss { size, align } => Some((*size, *align)),
        ItemKind::RefData { .. } => Some((8, 8)),
        ItemKind::Global { ty, .. } => Some((ty.size().max(8), if *ty == Type::LD { 16 } else { 8 })),
        _ => None,
    }
}

/// Pointer-sized cells still waiting for their target address.
struct PendingRef {
    block: usize,
    offset: usize,
    target: ItemId,
    disp: i64,
}

/// Generate native code for `module`.
///
/// `resolve` supplies addresses for imports and for forward declarations without a
/// local definition. On success the returned module owns all code and data memory.
pub fn generate(
    module: &Module,
    opts: &ActiveOpts,
    alloc: &ContextAlloc,
    resolve: &SymbolResolver<'_>,
) -> CompileResult<(GeneratedModule, SessionStats)> {
    validate_module(module)?;
    let session = CompilationSession::new(alloc);
    let inlined = inline::inline_module(module, opts, &session);
    let module = inlined.as_ref().unwrap_or(module);
    log::debug!("generating module {} under {:?}", module.name, opts.enabled_names());

    let nitems = module.items.len();
    let mut link = LinkTable::new(alloc, nitems);
    let mut data = IrVec::new_in(alloc.clone());
    let mut pending = IrVec::new_in(alloc.clone());
    let mut data_index = allocator_api2::vec![in alloc.clone(); None; nitems];

    let mut string_blocks = IrVec::with_capacity_in(module.strings.len(), alloc.clone());
    for s in module.strings.iter() {
        let mut block = DataBlock::new(alloc, s.len() as u64, 1)?;
        block.write(0, s)?;
        link.strings.push(block.addr());
        string_blocks.push(block);
    }

    for (i, item) in module.items.iter().enumerate() {
        let Some((size, align)) = storage_of(&item.kind) else {
            continue;
        };
        let mut block = DataBlock::new(alloc, size, align)?;
        match &item.kind {
            ItemKind::Data { bytes, .. } => block.write(0, bytes)?,
            ItemKind::RefData { target, disp } => pending.push(PendingRef {
                block: data.len(),
                offset: 0,
                target: *target,
                disp: *disp,
            }),
            ItemKind::Global { init: Some(Operand::Ref(target)), .. } => pending.push(PendingRef {
                block: data.len(),
                offset: 0,
                target: *target,
                disp: 0,
            }),
            ItemKind::Global { init: Some(Operand::Str(sid)), .. } => {
                let addr = link
                    .strings
                    .get(sid.0 as usize)
                    .ok_or_else(|| CompileError::internal(format!("string {} does not exist", sid.0)))?;
                block.write(0, &addr.to_le_bytes())?;
            }
            ItemKind::Global { ty, init: Some(value) } => {
                let (bytes, len) = scalar_bytes(*ty, value)
                    .ok_or_else(|| CompileError::internal(format!("bad initializer for global {}", item.name)))?;
                block.write(0, &bytes[..len])?;
            }
            _ => {}
        }
        link.addresses[i] = Some(block.addr());
        data_index[i] = Some(data.len());
        data.push(block);
    }

    for (i, item) in module.items.iter().enumerate() {
        let id = ItemId(i as u32);
        match item.kind {
            ItemKind::Import => {
                let addr = resolve(item.name.as_str()).ok_or_else(|| CompileError::UndefinedSymbol {
                    name: item.name.to_string(),
                })?;
                link.addresses[i] = Some(addr);
            }
            ItemKind::Forward | ItemKind::Export if module.resolve_func(id).is_none() => {
                let local = module
                    .find(&item.name, |k| storage_of(k).is_some())
                    .and_then(|d| link.addresses[d.index()]);
                link.addresses[i] = local.or_else(|| resolve(item.name.as_str()));
            }
            _ => {}
        }
    }

    for item in module.items.iter() {
        if let ItemKind::DataRef { data: cell, offset, target, disp } = item.kind {
            let block = data_index
                .get(cell.index())
                .copied()
                .flatten()
                .ok_or_else(|| CompileError::internal(format!("{} does not point into a data item", item.name)))?;
            pending.push(PendingRef {
                block,
                offset: offset as usize,
                target,
                disp,
            });
        }
    }

    let mut enc = X64Encoder::new()?;
    let mut bound = IrVec::new_in(alloc.clone());
    for (id, _, _) in module.funcs() {
        let label = enc.create_label();
        link.func_labels[id.index()] = Some(label);
        bound.push((id, label));
    }

    for ((_, item, func), (_, entry)) in module.funcs().zip(bound.iter_mut()) {
        session.begin_function(&item.name);
        log::debug!("lowering {} ({} insns, {} vars)", item.name, func.insns.len(), func.vars.len());
        let analysis = analysis::analyze(module, func, opts);
        for _ in analysis.homes.iter().flatten() {
            session.record(StatEvent::PromotedVar);
        }
        let phi_slots = if analysis.max_phis > 1 { analysis.max_phis } else { 0 };
        let frame = frame::FunctionFrame::build(alloc, func, &analysis.homes, phi_slots);
        enc.bind(entry)?;
        FunctionLowering::new(module, func, &item.name, &mut enc, &frame, &analysis, opts, &session, &link)
            .lower()
            .inspect_err(|e| log::debug!("lowering {} of {} failed: {e}", item.name, module.name))?;
    }

    let mut symbols = SymbolTable::with_hasher_in(DefaultHashBuilder::default(), alloc.clone());
    let code = if bound.is_empty() {
        None
    } else {
        let labels = ir_vec(alloc, bound.iter().map(|(_, l)| *l));
        let (bytes, offsets) = enc.finalize(&labels)?;
        let buffer = ExecBuffer::new(&bytes)?;
        let base = buffer.addr() as u64;

        let mut ends = ir_vec(alloc, offsets.iter().copied());
        ends.sort_unstable();
        for ((id, _), off) in bound.iter().zip(&offsets) {
            let item = &module.items[id.index()];
            let addr = base + *off;
            let end = ends.iter().copied().find(|e| e > off).unwrap_or(bytes.len() as u64);
            session.record_function_compiled(&item.name, (end - off) as usize);
            link.addresses[id.index()] = Some(addr);
            symbols.insert(item.name.clone(), Symbol { addr, is_func: true });
        }
        Some(buffer)
    };

    for p in &pending {
        let target = module.resolve_func(p.target).unwrap_or(p.target);
        let addr = link.addresses[target.index()]
            .or(link.addresses[p.target.index()])
            .ok_or_else(|| CompileError::UndefinedSymbol {
                name: module.item(p.target).map_or_else(String::new, |it| it.name.to_string()),
            })?;
        let value = addr.wrapping_add_signed(p.disp);
        data[p.block].write(p.offset, &value.to_le_bytes())?;
    }

    for (i, item) in module.items.iter().enumerate() {
        if let (Some(_), Some(addr)) = (data_index[i], link.addresses[i]) {
            symbols
                .entry(item.name.clone())
                .or_insert(Symbol { addr, is_func: false });
        }
    }
    data.extend(string_blocks);

    let stats = session.stats();
    log::debug!(
        "module {}: {} functions, {} code bytes, {} data bytes",
        module.name,
        stats.functions,
        code.as_ref().map_or(0, ExecBuffer::len),
        data.iter().map(DataBlock::len).sum::<usize>()
    );
    Ok((
        GeneratedModule {
            name: module.name.clone(),
            code,
            data,
            symbols,
        },
        stats,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::options::{OptFlags, TargetCaps};
    use crate::ir::{FuncBuilder, MemOp, Opcode};

    fn active(flags: OptFlags) -> ActiveOpts {
        flags.resolve(TargetCaps::detect())
    }

    #[test]
    fn test_x87_encoding() {
        // 1.0 = mantissa 0x8000..., exponent 0x3fff.
        let one = f64_to_x87(1.0);
        assert_eq!(&one[..8], &(1u64 << 63).to_le_bytes());
        assert_eq!(&one[8..], &0x3fffu16.to_le_bytes());
        let neg = f64_to_x87(-2.0);
        assert_eq!(u16::from_le_bytes([neg[8], neg[9]]), 0xc000);
        assert_eq!(f64_to_x87(0.0), [0; 10]);
    }

    #[test]
    fn test_scalar_initializers() {
        let used = |ty, v| scalar_bytes(ty, &v).map(|(b, n)| b[..n].to_vec());
        assert_eq!(used(Type::I32, Operand::Int(-1)), Some(vec![0xff; 4]));
        assert_eq!(used(Type::D, Operand::Double(0.5)), Some(0.5f64.to_le_bytes().to_vec()));
        assert_eq!(used(Type::LD, Operand::Double(1.0)).map(|b| b.len()), Some(10));
        assert!(scalar_bytes(Type::I64, &Operand::Double(1.0)).is_none());
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    #[test]
    fn test_generate_links_data_and_functions() {
        let alloc = ContextAlloc::system();
        let mut m = Module::new("m", &alloc);
        let counter = m.add_item(
            "counter",
            ItemKind::Global {
                ty: Type::I64,
                init: Some(Operand::Int(41)),
            },
        );
        let mut b = FuncBuilder::new(&mut m, "bump", vec![Type::I64], &[], false);
        let p = b.var("p", Type::I64);
        let r = b.var("r", Type::I64);
        b.emit(Opcode::Mov, [p.into(), counter.into()]);
        b.emit(Opcode::Mov, [r.into(), Operand::Mem(MemOp::based(Type::I64, p, 0))]);
        b.emit(Opcode::Add, [r.into(), r.into(), Operand::Int(1)]);
        b.emit(Opcode::Mov, [Operand::Mem(MemOp::based(Type::I64, p, 0)), r.into()]);
        b.emit(Opcode::Ret, [r.into()]);
        let bump = b.finish();
        let cell = m.add_item("fp", ItemKind::RefData { target: bump, disp: 0 });
        let _ = cell;

        let (generated, stats) = generate(&m, &active(OptFlags::standard()), &alloc, &|_| None).unwrap();
        assert_eq!(stats.functions, 1);
        let f = generated.function("bump").unwrap();
        assert!(generated.contains_code(f));
        assert!(generated.function("counter").is_none());
        let fp = generated.symbol("fp").unwrap();
        assert_eq!(unsafe { *(fp as *const u64) }, f);

        let call: extern "C" fn() -> i64 = unsafe { std::mem::transmute(f as usize) };
        assert_eq!(call(), 42);
        assert_eq!(call(), 43);
    }

    #[test]
    fn test_unresolved_import_is_user_error() {
        let alloc = ContextAlloc::system();
        let mut m = Module::new("m", &alloc);
        m.add_import("no_such_symbol_anywhere");
        let err = generate(&m, &active(OptFlags::none()), &alloc, &|_| None).unwrap_err();
        assert!(!err.is_internal());
    }
}
