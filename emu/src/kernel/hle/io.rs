//! `IoFileMgrForUser`: files and directories on the mounted drives.
//!
//! Guest descriptors are kernel object UIDs wrapping a meta filesystem
//! handle. Descriptors 1 and 2 are the console's stdout and stderr and go to
//! the log.

use std::io::SeekFrom;

use tracing::{info, warn};

use crate::kernel::error;
use crate::kernel::filesystem::{FileInfo, FileSystem, FileType, FsError};
use crate::kernel::object::{OpenDirectory, OpenFile};

use super::{Hle, HleFunction, HleRegistry, HleReturn};

const MODULE: &str = "IoFileMgrForUser";

const STDOUT: u32 = 1;
const STDERR: u32 = 2;
/// `sizeof(SceIoStat)`; the entry name of a `SceIoDirent` follows it.
const STAT_SIZE: u32 = 0x58;
const NAME_SIZE: usize = 256;
const ATTR_DIRECTORY: u32 = 0x10;
const ATTR_FILE: u32 = 0x20;

const FUNCTIONS: &[(u32, HleFunction)] = &[
    (0x109F_50BC, HleFunction::new("sceIoOpen", open)),
    (0x810C_4BC3, HleFunction::new("sceIoClose", close)),
    (0x6A63_8D83, HleFunction::new("sceIoRead", read)),
    (0x42EC_03AC, HleFunction::new("sceIoWrite", write)),
    (0x27EB_27B8, HleFunction::new("sceIoLseek", lseek)),
    (0x6896_3324, HleFunction::new("sceIoLseek32", lseek32)),
    (0xB29D_DF9C, HleFunction::new("sceIoDopen", dopen)),
    (0xE3EB_004C, HleFunction::new("sceIoDread", dread)),
    (0xEB09_2469, HleFunction::new("sceIoDclose", dclose)),
    (0x06A7_0004, HleFunction::new("sceIoMkdir", mkdir)),
    (0x1117_C65F, HleFunction::new("sceIoRmdir", rmdir)),
    (0xF27A_9C51, HleFunction::new("sceIoRemove", remove)),
    (0x7791_03A0, HleFunction::new("sceIoRename", rename)),
    (0xACE9_46E8, HleFunction::new("sceIoGetstat", getstat)),
    (0x55F4_717D, HleFunction::new("sceIoChdir", chdir)),
];

pub(super) fn register(registry: &mut HleRegistry) {
    for (nid, function) in FUNCTIONS {
        registry.register(MODULE, *nid, *function);
    }
}

fn fs_code<T>(result: Result<T, FsError>) -> Result<T, u32> {
    result.map_err(|e| {
        warn!("io: {e}");
        e.code()
    })
}

fn handle(hle: &Hle, fd: u32) -> Result<u32, u32> {
    hle.kernel
        .objects
        .get::<OpenFile>(fd)
        .map(|file| file.handle)
        .ok_or(error::BADF)
}

fn open(hle: &mut Hle) -> HleReturn {
    let (path, flags) = (hle.arg_string(0), hle.arg(1));
    let result = fs_code(hle.fs.open_file(&path, flags)).and_then(|handle| {
        hle.kernel
            .objects
            .create(OpenFile { path, handle })
            .ok_or(error::NO_MEMORY)
    });
    result.into()
}

fn close(hle: &mut Hle) -> HleReturn {
    let fd = hle.arg(0);
    let Some(file) = hle.kernel.objects.destroy_as::<OpenFile>(fd) else {
        return HleReturn::U32(error::BADF);
    };
    fs_code(hle.fs.close_file(file.handle)).into()
}

fn read_into(hle: &mut Hle, fd: u32, address: u32, size: u32) -> Result<u32, u32> {
    let handle = handle(hle, fd)?;
    let buf = hle
        .memory
        .slice_mut(address, size as usize)
        .ok_or(error::ILLEGAL_ADDR)?;
    let n = fs_code(hle.fs.read(handle, buf))? as u32;
    hle.gpu.invalidate_texture(address, n);
    Ok(n)
}

fn read(hle: &mut Hle) -> HleReturn {
    let (fd, address, size) = (hle.arg(0), hle.arg(1), hle.arg(2));
    read_into(hle, fd, address, size).into()
}

fn write(hle: &mut Hle) -> HleReturn {
    let (fd, address, size) = (hle.arg(0), hle.arg(1), hle.arg(2));
    let Some(data) = hle.memory.slice(address, size as usize) else {
        return HleReturn::U32(error::ILLEGAL_ADDR);
    };
    if fd == STDOUT || fd == STDERR {
        let text = String::from_utf8_lossy(data);
        info!(target: "guest", "{}", text.trim_end());
        return HleReturn::U32(size);
    }
    let data = data.to_vec();
    handle(hle, fd)
        .and_then(|handle| fs_code(hle.fs.write(handle, &data)).map(|n| n as u32))
        .into()
}

fn seek_from(offset: i64, whence: u32) -> Option<SeekFrom> {
    match whence {
        0 => u64::try_from(offset).ok().map(SeekFrom::Start),
        1 => Some(SeekFrom::Current(offset)),
        2 => Some(SeekFrom::End(offset)),
        _ => None,
    }
}

fn seek(hle: &mut Hle, fd: u32, offset: i64, whence: u32) -> Result<u64, u32> {
    let handle = handle(hle, fd)?;
    let position = seek_from(offset, whence).ok_or(error::ILLEGAL_ARGUMENT)?;
    fs_code(hle.fs.seek(handle, position))
}

/// The 64-bit offset sits in the aligned `a2:a3` pair.
fn lseek(hle: &mut Hle) -> HleReturn {
    let (fd, offset, whence) = (hle.arg(0), hle.arg_u64(2) as i64, hle.arg(4));
    match seek(hle, fd, offset, whence) {
        Ok(position) => HleReturn::U64(position),
        Err(code) => HleReturn::U64(u64::from(code) | 0xFFFF_FFFF_0000_0000),
    }
}

fn lseek32(hle: &mut Hle) -> HleReturn {
    let (fd, offset, whence) = (hle.arg(0), i64::from(hle.arg_i32(1)), hle.arg(2));
    seek(hle, fd, offset, whence).map(|p| p as u32).into()
}

fn dopen(hle: &mut Hle) -> HleReturn {
    let path = hle.arg_string(0);
    let result = fs_code(hle.fs.open_directory(&path)).and_then(|entries| {
        hle.kernel
            .objects
            .create(OpenDirectory {
                path,
                entries,
                position: 0,
            })
            .ok_or(error::NO_MEMORY)
    });
    result.into()
}

fn write_stat(hle: &mut Hle, address: u32, info: &FileInfo) {
    hle.memory.memset(address, 0, STAT_SIZE as usize);
    let attr = match info.file_type {
        FileType::File => ATTR_FILE,
        FileType::Directory => ATTR_DIRECTORY,
    };
    hle.memory.write_u32(address, info.mode());
    hle.memory.write_u32(address + 4, attr);
    hle.memory.write_u32(address + 8, info.size as u32);
    hle.memory.write_u32(address + 12, (info.size >> 32) as u32);
}

/// Fills the `SceIoDirent` in `a1`. Returns 1 per entry and 0 at the end.
fn dread(hle: &mut Hle) -> HleReturn {
    let (fd, dirent) = (hle.arg(0), hle.arg(1));
    let Some(directory) = hle.kernel.objects.get_mut::<OpenDirectory>(fd) else {
        return HleReturn::U32(error::BADF);
    };
    let Some(entry) = directory.entries.get(directory.position).cloned() else {
        return HleReturn::U32(0);
    };
    directory.position += 1;
    write_stat(hle, dirent, &entry);
    let mut name = entry.name;
    name.truncate(NAME_SIZE - 1);
    hle.memory.write_cstring(dirent + STAT_SIZE, &name);
    HleReturn::U32(1)
}

fn dclose(hle: &mut Hle) -> HleReturn {
    match hle.kernel.objects.destroy_as::<OpenDirectory>(hle.arg(0)) {
        Some(_) => HleReturn::U32(error::OK),
        None => HleReturn::U32(error::BADF),
    }
}

fn mkdir(hle: &mut Hle) -> HleReturn {
    let path = hle.arg_string(0);
    fs_code(hle.fs.create_directory(&path)).into()
}

fn rmdir(hle: &mut Hle) -> HleReturn {
    let path = hle.arg_string(0);
    fs_code(hle.fs.remove_directory(&path)).into()
}

fn remove(hle: &mut Hle) -> HleReturn {
    let path = hle.arg_string(0);
    fs_code(hle.fs.remove_file(&path)).into()
}

fn rename(hle: &mut Hle) -> HleReturn {
    let (from, to) = (hle.arg_string(0), hle.arg_string(1));
    fs_code(hle.fs.rename(&from, &to)).into()
}

fn getstat(hle: &mut Hle) -> HleReturn {
    let (path, out) = (hle.arg_string(0), hle.arg(1));
    match fs_code(hle.fs.get_stat(&path)) {
        Ok(info) => {
            write_stat(hle, out, &info);
            HleReturn::U32(error::OK)
        }
        Err(code) => HleReturn::U32(code),
    }
}

fn chdir(hle: &mut Hle) -> HleReturn {
    let path = hle.arg_string(0);
    fs_code(hle.fs.change_directory(&path)).into()
}
