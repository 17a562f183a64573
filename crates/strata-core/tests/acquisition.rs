//! Tests for target acquisition

mod common;

use std::fs;
use std::sync::Arc;

use common::{init_logging, isolated_config, CoreBuilder, FakeKdump, VMCOREINFO};
use object::elf;
use strata_core::target::KDUMP_SIGNATURE;
use strata_core::vmcoreinfo::VmcoreInfoFallback;
use strata_core::{
    AddressSpace, Architecture, ErrorKind, MemoryReader, Platform, Program, ProgramFlags, Result, StrataError,
    TargetSource, VmcoreInfo,
};

fn snapshot(_file: &fs::File) -> std::io::Result<bool>
{
    Ok(true)
}

fn not_snapshot(_file: &fs::File) -> std::io::Result<bool>
{
    Ok(false)
}

#[test]
fn test_setting_target_twice_fails()
{
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let first = CoreBuilder::new()
        .load(0x1000, 0, b"first")
        .load(0x2000, 0, b"first")
        .write_to(&dir.path().join("core.1"));
    let second = CoreBuilder::new().load(0x5000, 0, b"second").write_to(&dir.path().join("core.2"));

    let mut program = Program::with_config(isolated_config(dir.path()));
    program.set_core_dump(&first).unwrap();

    let err = program.set_core_dump(&second).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(err.to_string(), "invalid argument: program memory was already initialized");
    assert_eq!(program.memory().segments().len(), 2);
    assert_eq!(program.source().and_then(TargetSource::path), Some(first.as_path()));

    assert_eq!(program.set_pid(1).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(program.set_kernel().unwrap_err().kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_custom_segments_count_as_initialized()
{
    let dir = tempfile::tempdir().unwrap();
    let core = CoreBuilder::new().load(0x1000, 0, b"data").write_to(&dir.path().join("core"));
    let mut program = Program::with_config(isolated_config(dir.path()));
    let reader = Arc::new(|buf: &mut [u8], _address: u64, _offset: u64, _physical: bool| -> Result<()> {
        buf.fill(0);
        Ok(())
    });
    program.add_memory_segment(0, 0x1000, reader, false);
    assert!(program.set_core_dump(&core).is_err());
    assert!(program.source().is_none());
}

#[test]
fn test_core_without_physical_addresses()
{
    let dir = tempfile::tempdir().unwrap();
    let core = CoreBuilder::new()
        .load(0x40_0000, 0, &[1; 16])
        .load(0x60_0000, 0, &[2; 16])
        .load(0x7fff_0000, 0, &[3; 16])
        .write_to(&dir.path().join("core"));

    let mut program = Program::with_config(isolated_config(dir.path()));
    program.set_core_dump(&core).unwrap();
    let memory = program.memory();
    assert_eq!(memory.segments_in(AddressSpace::Virtual).count(), 3);
    assert_eq!(memory.segments_in(AddressSpace::Physical).count(), 0);
    assert_eq!(program.flags(), ProgramFlags::empty());
    assert!(program.vmcoreinfo().is_none());
    assert!(matches!(program.source(), Some(TargetSource::CoreDump { .. })));
}

#[test]
fn test_sentinel_physical_address_is_skipped()
{
    let dir = tempfile::tempdir().unwrap();
    let core = CoreBuilder::new()
        .load(0xffff_8000_0000_0000, u64::MAX, &[1; 16])
        .load(0xffff_8000_0010_0000, 0x10_0000, &[2; 16])
        .write_to(&dir.path().join("core"));

    let mut program = Program::with_config(isolated_config(dir.path()));
    program.set_core_dump(&core).unwrap();
    let physical: Vec<_> = program.memory().segments_in(AddressSpace::Physical).collect();
    assert_eq!(physical.len(), 1);
    assert_eq!(physical[0].start, 0x10_0000);
    assert_eq!(program.memory().segments_in(AddressSpace::Virtual).count(), 2);

    let mut buf = [0u8; 4];
    program.read_memory(&mut buf, 0x10_0000, true).unwrap();
    assert_eq!(buf, [2; 4]);
}

#[test]
fn test_kdump_signature_wins_over_elf()
{
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut bytes = KDUMP_SIGNATURE.to_vec();
    bytes.extend_from_slice(&CoreBuilder::new().load(0x1000, 0, b"elf").build());
    let path = dir.path().join("vmcore");
    fs::write(&path, bytes).unwrap();

    let decoder = FakeKdump::new(VMCOREINFO);
    let config = isolated_config(dir.path()).with_kdump_decoder(Some(decoder.clone()));
    let mut program = Program::with_config(config);
    program.set_core_dump(&path).unwrap();

    assert_eq!(decoder.opened(), 1);
    assert!(matches!(program.source(), Some(TargetSource::Kdump { .. })));
    assert_eq!(program.flags(), ProgramFlags::IS_LINUX_KERNEL);
    assert_eq!(program.vmcoreinfo().unwrap().osrelease, "6.8.0-strata");
    assert!(program.platform().is_none());

    let mut buf = [0u8; 4];
    program.read_memory(&mut buf, 0xffff_ffff_8100_0010, false).unwrap();
    assert_eq!(buf, [0x10, 0x11, 0x12, 0x13]);
    program.read_memory(&mut buf, 0x20, true).unwrap();
    assert_eq!(buf, [0x20, 0x21, 0x22, 0x23]);
}

#[test]
fn test_kdump_without_decoder_leaves_program_empty()
{
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vmcore");
    fs::write(&path, b"KDUMP   \x06\0\0\0rest of the header").unwrap();

    let mut program = Program::with_config(isolated_config(dir.path()).with_kdump_decoder(None));
    let err = program.set_core_dump(&path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(program.source().is_none());
    assert!(program.memory().is_empty());
}

#[test]
fn test_task_struct_on_procfs_is_live_kernel()
{
    let dir = tempfile::tempdir().unwrap();
    let core = CoreBuilder::new()
        .task_struct()
        .vmcoreinfo(VMCOREINFO)
        .load(0xffff_ffff_8100_0000, 0x100_0000, &[0x90; 32])
        .write_to(&dir.path().join("kcore-copy"));

    let mut live = Program::with_config(isolated_config(dir.path()).with_snapshot_probe(snapshot));
    live.set_core_dump(&core).unwrap();
    assert_eq!(live.flags(), ProgramFlags::IS_LINUX_KERNEL | ProgramFlags::IS_LIVE);
    assert!(matches!(live.source(), Some(TargetSource::KernelSnapshot { .. })));

    let mut copy = Program::with_config(isolated_config(dir.path()).with_snapshot_probe(not_snapshot));
    copy.set_core_dump(&core).unwrap();
    assert_eq!(copy.flags(), ProgramFlags::IS_LINUX_KERNEL);
    assert!(matches!(copy.source(), Some(TargetSource::CoreDump { .. })));
}

#[test]
fn test_ordinary_file_is_not_procfs()
{
    let dir = tempfile::tempdir().unwrap();
    let core = CoreBuilder::new()
        .task_struct()
        .vmcoreinfo(VMCOREINFO)
        .load(0x1000, 0, &[0; 8])
        .write_to(&dir.path().join("core"));

    // Default probe: fstatfs on a tempdir file.
    let mut program = Program::with_config(isolated_config(dir.path()));
    program.set_core_dump(&core).unwrap();
    assert!(!program.flags().contains(ProgramFlags::IS_LIVE));
}

#[test]
fn test_vmcoreinfo_routes_to_kdump_when_preferred()
{
    let dir = tempfile::tempdir().unwrap();
    let core = CoreBuilder::new()
        .vmcoreinfo(VMCOREINFO)
        .load(0xffff_ffff_8100_0000, 0x100_0000, &[0x90; 32])
        .write_to(&dir.path().join("vmcore"));

    let decoder = FakeKdump::new(VMCOREINFO);
    let config = isolated_config(dir.path())
        .with_kdump_decoder(Some(decoder.clone()))
        .with_kdump_for_elf(Some(true));
    let mut program = Program::with_config(config);
    program.set_core_dump(&core).unwrap();
    assert_eq!(decoder.opened(), 1);
    assert!(matches!(program.source(), Some(TargetSource::Kdump { .. })));

    let config = isolated_config(dir.path()).with_kdump_decoder(Some(decoder.clone()));
    let mut native = Program::with_config(config);
    native.set_core_dump(&core).unwrap();
    assert_eq!(decoder.opened(), 1);
    assert!(matches!(native.source(), Some(TargetSource::CoreDump { .. })));
    assert_eq!(native.flags(), ProgramFlags::IS_LINUX_KERNEL);
    assert_eq!(native.vmcoreinfo().unwrap().kaslr_offset, 0x100_0000);
    assert_eq!(native.memory().segments_in(AddressSpace::Physical).count(), 1);
}

#[test]
fn test_snapshot_is_never_routed_to_kdump()
{
    let dir = tempfile::tempdir().unwrap();
    let core = CoreBuilder::new()
        .task_struct()
        .vmcoreinfo(VMCOREINFO)
        .load(0x1000, 0, &[0; 8])
        .write_to(&dir.path().join("kcore"));

    let decoder = FakeKdump::new(VMCOREINFO);
    let config = isolated_config(dir.path())
        .with_kdump_decoder(Some(decoder.clone()))
        .with_kdump_for_elf(Some(true))
        .with_snapshot_probe(snapshot);
    let mut program = Program::with_config(config);
    program.set_core_dump(&core).unwrap();
    assert_eq!(decoder.opened(), 0);
    assert!(matches!(program.source(), Some(TargetSource::KernelSnapshot { .. })));
}

#[test]
fn test_eight_byte_aligned_notes()
{
    let dir = tempfile::tempdir().unwrap();
    let core = CoreBuilder::new()
        .note_align(8)
        .note(b"CORE", 1, &[0; 12])
        .vmcoreinfo(VMCOREINFO)
        .load(0x1000, 0, &[0; 8])
        .write_to(&dir.path().join("core"));

    let mut program = Program::with_config(isolated_config(dir.path()));
    program.set_core_dump(&core).unwrap();
    assert_eq!(program.vmcoreinfo().unwrap().page_size, 4096);
}

#[test]
fn test_wide_note_segment_alignment_uses_four_byte_records()
{
    let dir = tempfile::tempdir().unwrap();
    for p_align in [0, 16, 0x1000] {
        let core = CoreBuilder::new()
            .note_segment_align(p_align)
            .note(b"CORE", 1, &[0; 12])
            .vmcoreinfo(VMCOREINFO)
            .load(0x1000, 0x1000, &[0; 8])
            .write_to(&dir.path().join(format!("core.{p_align}")));

        let mut program = Program::with_config(isolated_config(dir.path()));
        program.set_core_dump(&core).unwrap();
        assert_eq!(program.flags(), ProgramFlags::IS_LINUX_KERNEL);
        assert_eq!(program.vmcoreinfo().unwrap().osrelease, "6.8.0-strata");
    }
}

#[test]
fn test_malformed_vmcoreinfo_rolls_back()
{
    let dir = tempfile::tempdir().unwrap();
    let core = CoreBuilder::new()
        .vmcoreinfo(b"OSRELEASE=6.8.0\nPAGESIZE=banana\n")
        .load(0x1000, 0x1000, &[0; 8])
        .write_to(&dir.path().join("core"));

    let mut program = Program::with_config(isolated_config(dir.path()));
    let err = program.set_core_dump(&core).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
    assert!(program.memory().is_empty());
    assert!(program.source().is_none());
    assert!(program.platform().is_none());
    assert_eq!(program.flags(), ProgramFlags::empty());

    // The failed attempt does not count as initialization.
    let good = CoreBuilder::new().load(0x1000, 0, &[0; 8]).write_to(&dir.path().join("core.good"));
    program.set_core_dump(&good).unwrap();
}

#[test]
fn test_non_core_elf_is_rejected()
{
    let dir = tempfile::tempdir().unwrap();
    let exe = CoreBuilder::new()
        .e_type(elf::ET_EXEC)
        .load(0x40_0000, 0, &[0; 8])
        .write_to(&dir.path().join("a.out"));
    let text = dir.path().join("notes.txt");
    fs::write(&text, "not an object file at all").unwrap();

    let mut program = Program::with_config(isolated_config(dir.path()));
    let err = program.set_core_dump(&exe).unwrap_err();
    assert_eq!(err.to_string(), "not an ELF core file");
    assert_eq!(program.set_core_dump(&text).unwrap_err().kind(), ErrorKind::Format);
    assert!(program.memory().is_empty());
}

struct FixedVmcoreInfo;

impl VmcoreInfoFallback for FixedVmcoreInfo
{
    fn read_vmcoreinfo(&self, memory: &MemoryReader) -> Result<VmcoreInfo>
    {
        assert!(!memory.is_empty());
        VmcoreInfo::parse(b"OSRELEASE=6.1.0-fallback\nPAGESIZE=16384\n")
    }
}

#[test]
fn test_snapshot_without_vmcoreinfo_uses_fallback()
{
    let dir = tempfile::tempdir().unwrap();
    let core = CoreBuilder::new()
        .task_struct()
        .load(0xffff_ffff_8100_0000, 0x100_0000, &[0; 8])
        .write_to(&dir.path().join("kcore"));

    let config = isolated_config(dir.path())
        .with_snapshot_probe(snapshot)
        .with_vmcoreinfo_fallback(Arc::new(FixedVmcoreInfo));
    let mut program = Program::with_config(config);
    program.set_core_dump(&core).unwrap();
    let info = program.vmcoreinfo().unwrap();
    assert_eq!(info.osrelease, "6.1.0-fallback");
    assert_eq!(info.page_size, 16384);
    assert_eq!(program.flags(), ProgramFlags::IS_LINUX_KERNEL | ProgramFlags::IS_LIVE);
}

#[test]
fn test_set_kernel_reads_kcore_under_proc_root()
{
    let dir = tempfile::tempdir().unwrap();
    CoreBuilder::new()
        .task_struct()
        .vmcoreinfo(VMCOREINFO)
        .load(0xffff_ffff_8100_0000, 0x100_0000, b"linux")
        .write_to(&dir.path().join("kcore"));

    let mut program = Program::with_config(isolated_config(dir.path()).with_snapshot_probe(snapshot));
    program.set_kernel().unwrap();
    assert_eq!(program.flags(), ProgramFlags::IS_LINUX_KERNEL | ProgramFlags::IS_LIVE);
    assert_eq!(program.source().and_then(TargetSource::path), Some(dir.path().join("kcore").as_path()));

    let mut buf = [0u8; 5];
    program.read_memory(&mut buf, 0xffff_ffff_8100_0000, false).unwrap();
    assert_eq!(&buf, b"linux");
}

#[test]
fn test_platform_from_header_unless_already_set()
{
    let dir = tempfile::tempdir().unwrap();
    let core = CoreBuilder::new()
        .machine(elf::EM_AARCH64)
        .load(0x1000, 0, &[0; 8])
        .write_to(&dir.path().join("core"));

    let mut program = Program::with_config(isolated_config(dir.path()));
    program.set_core_dump(&core).unwrap();
    assert_eq!(program.platform().unwrap().arch(), Architecture::Aarch64);

    let x86 = Platform::create(Architecture::X86_64, None).unwrap();
    let mut pinned = Program::with_platform(x86);
    pinned.set_core_dump(&core).unwrap();
    assert_eq!(pinned.platform(), Some(x86));
}

#[test]
fn test_live_process_under_fake_proc_root()
{
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("4242")).unwrap();
    let mut mem = vec![0u8; 0x100];
    mem[0x40..0x45].copy_from_slice(b"hello");
    fs::write(dir.path().join("4242/mem"), mem).unwrap();

    let mut program = Program::with_config(isolated_config(dir.path()));
    program.set_pid(4242).unwrap();
    assert_eq!(program.flags(), ProgramFlags::IS_LIVE);
    assert_eq!(program.pid(), Some(4242));
    assert_eq!(program.platform(), Some(Platform::host()));
    assert!(program.source().and_then(TargetSource::path).is_none());

    let mut buf = [0u8; 5];
    program.read_memory(&mut buf, 0x40, false).unwrap();
    assert_eq!(&buf, b"hello");
}

#[test]
fn test_missing_process_is_os_error()
{
    let dir = tempfile::tempdir().unwrap();
    let mut program = Program::with_config(isolated_config(dir.path()));
    let err = program.set_pid(99).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Os);
    assert_eq!(err.errno(), Some(2)); // ENOENT
    assert_eq!(err.path(), Some(dir.path().join("99/mem").as_path()));
    assert!(matches!(err, StrataError::Os { op: "open", .. }));
    assert!(program.pid().is_none());
}
