//! JLink vendor-DLL back-end.
//!
//! Loads the SEGGER `JLinkARM` shared library from a user-supplied path
//! and drives the classic C API. Register access uses the JLinkARM
//! Cortex-M indexing (`r0..r15` = 0..15, `xpsr` = 16).

use crate::config::InterfaceMode;
use crate::link::{cortex_m_reg_index, LinkDriver, LinkError};
use libloading::{Library, Symbol};
use std::ffi::{c_char, c_void, CStr, CString};
use std::path::Path;
use tracing::debug;

pub struct JlinkLink {
    lib: Library,
}

impl JlinkLink {
    pub fn open(
        library: &Path,
        interface: InterfaceMode,
        device: &str,
        speed_khz: u32,
    ) -> Result<Self, LinkError> {
        let lib = unsafe { Library::new(library) }.map_err(|e| {
            LinkError::Transport(format!(
                "Could not load the JLink library at {}. {e}",
                library.display()
            ))
        })?;
        let link = Self { lib };

        unsafe {
            let open: Symbol<unsafe extern "C" fn() -> *const c_char> =
                link.sym(b"JLINKARM_Open\0")?;
            let err = open();
            if !err.is_null() {
                return Err(LinkError::Transport(
                    CStr::from_ptr(err).to_string_lossy().into_owned(),
                ));
            }
        }

        link.exec_command(&format!("Device = {device}"))?;

        unsafe {
            let tif_select: Symbol<unsafe extern "C" fn(i32) -> i32> =
                link.sym(b"JLINKARM_TIF_Select\0")?;
            let tif = match interface {
                InterfaceMode::Jtag => 0,
                InterfaceMode::Swd => 1,
                InterfaceMode::CJtag => 7,
            };
            if tif_select(tif) != 0 {
                return Err(LinkError::Unsupported(
                    "the probe rejected the requested target interface",
                ));
            }

            let set_speed: Symbol<unsafe extern "C" fn(u32)> = link.sym(b"JLINKARM_SetSpeed\0")?;
            set_speed(speed_khz);

            let connect: Symbol<unsafe extern "C" fn() -> i32> = link.sym(b"JLINKARM_Connect\0")?;
            if connect() < 0 {
                return Err(LinkError::Transport(
                    "JLink could not connect to the target".to_owned(),
                ));
            }
        }

        debug!(device, %interface, speed_khz, "Opened JLink probe");
        Ok(link)
    }

    fn sym<'lib, T>(&'lib self, name: &[u8]) -> Result<Symbol<'lib, T>, LinkError> {
        unsafe { self.lib.get(name) }.map_err(|e| {
            LinkError::Transport(format!(
                "JLink library is missing symbol {}. {e}",
                String::from_utf8_lossy(&name[..name.len() - 1])
            ))
        })
    }

    fn exec_command(&self, cmd: &str) -> Result<(), LinkError> {
        let cmd = CString::new(cmd)
            .map_err(|_| LinkError::Transport("JLink command contains a NUL byte".to_owned()))?;
        let mut err_buf = [0 as c_char; 256];
        unsafe {
            let exec: Symbol<unsafe extern "C" fn(*const c_char, *mut c_char, i32) -> i32> =
                self.sym(b"JLINKARM_ExecCommand\0")?;
            exec(cmd.as_ptr(), err_buf.as_mut_ptr(), err_buf.len() as i32);
            if err_buf[0] != 0 {
                return Err(LinkError::Transport(
                    CStr::from_ptr(err_buf.as_ptr()).to_string_lossy().into_owned(),
                ));
            }
        }
        Ok(())
    }

    fn reg_index(reg: &str) -> Result<i32, LinkError> {
        cortex_m_reg_index(reg)
            .map(i32::from)
            .ok_or_else(|| LinkError::UnsupportedRegister(reg.to_owned()))
    }
}

impl LinkDriver for JlinkLink {
    fn read_mem(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, LinkError> {
        let mut buf = vec![0u8; len];
        unsafe {
            let read_mem: Symbol<unsafe extern "C" fn(u32, u32, *mut c_void) -> i32> =
                self.sym(b"JLINKARM_ReadMem\0")?;
            if read_mem(addr, len as u32, buf.as_mut_ptr() as *mut c_void) != 0 {
                return Err(LinkError::BusFault { addr });
            }
        }
        Ok(buf)
    }

    fn write_mem(&mut self, addr: u32, data: &[u8]) -> Result<(), LinkError> {
        unsafe {
            let write_mem: Symbol<unsafe extern "C" fn(u32, u32, *const c_void) -> i32> =
                self.sym(b"JLINKARM_WriteMem\0")?;
            if write_mem(addr, data.len() as u32, data.as_ptr() as *const c_void) != 0 {
                return Err(LinkError::BusFault { addr });
            }
        }
        Ok(())
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), LinkError> {
        unsafe {
            let write_u32: Symbol<unsafe extern "C" fn(u32, u32) -> i32> =
                self.sym(b"JLINKARM_WriteU32\0")?;
            if write_u32(addr, value) != 0 {
                return Err(LinkError::BusFault { addr });
            }
        }
        Ok(())
    }

    fn read_reg(&mut self, reg: &str) -> Result<u32, LinkError> {
        let index = Self::reg_index(reg)?;
        unsafe {
            let read_reg: Symbol<unsafe extern "C" fn(i32) -> u32> =
                self.sym(b"JLINKARM_ReadReg\0")?;
            Ok(read_reg(index))
        }
    }

    fn write_reg(&mut self, reg: &str, value: u32) -> Result<(), LinkError> {
        let index = Self::reg_index(reg)?;
        unsafe {
            let write_reg: Symbol<unsafe extern "C" fn(i32, u32) -> i32> =
                self.sym(b"JLINKARM_WriteReg\0")?;
            if write_reg(index, value) != 0 {
                return Err(LinkError::Transport(format!(
                    "JLink refused the write to register {reg}"
                )));
            }
        }
        Ok(())
    }

    fn halt(&mut self) -> Result<(), LinkError> {
        unsafe {
            let halt: Symbol<unsafe extern "C" fn() -> i32> = self.sym(b"JLINKARM_Halt\0")?;
            if halt() != 0 {
                return Err(LinkError::Transport("JLink halt request failed".to_owned()));
            }
        }
        Ok(())
    }

    fn go(&mut self) -> Result<(), LinkError> {
        unsafe {
            let go: Symbol<unsafe extern "C" fn()> = self.sym(b"JLINKARM_Go\0")?;
            go();
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), LinkError> {
        if !self.halted()? {
            return Err(LinkError::NotHalted);
        }
        unsafe {
            let step: Symbol<unsafe extern "C" fn() -> c_char> = self.sym(b"JLINKARM_Step\0")?;
            if step() != 0 {
                return Err(LinkError::Transport("JLink step request failed".to_owned()));
            }
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), LinkError> {
        unsafe {
            let reset: Symbol<unsafe extern "C" fn()> = self.sym(b"JLINKARM_Reset\0")?;
            reset();
        }
        Ok(())
    }

    fn halted(&mut self) -> Result<bool, LinkError> {
        unsafe {
            let is_halted: Symbol<unsafe extern "C" fn() -> i32> =
                self.sym(b"JLINKARM_IsHalted\0")?;
            let state = is_halted();
            if state < 0 {
                return Err(LinkError::Transport(
                    "JLink could not query the core state".to_owned(),
                ));
            }
            Ok(state != 0)
        }
    }

    fn close(&mut self) {
        if let Ok(close) = unsafe {
            self.lib
                .get::<unsafe extern "C" fn()>(b"JLINKARM_Close\0")
        } {
            unsafe { close() };
        }
    }
}
