//! Keil uVision COM back-end.
//!
//! Drives a running uVision instance through its automation object. All
//! memory traffic goes through the debugger's expression evaluator
//! (`_RBYTE`/`_RDWORD`/`_WBYTE`/`_WDWORD`) one unit per call, which is
//! slow but the only surface the automation interface offers. Run control
//! uses `Execute` command strings; single-step is not available.
//!
//! The COM plumbing sits behind the [`UvEngine`] trait so the driver
//! logic is testable off-Windows.

use crate::link::{LinkDriver, LinkError};
use tracing::debug;

/// uVision debugger state values reported by `Debugger.State`.
const UV_STATE_STOPPED: i32 = 1;

/// The slice of the uVision automation object the driver needs.
pub trait UvEngine: Send {
    /// Evaluate a debugger expression and return its numeric value.
    fn evaluate(&mut self, expr: &str) -> Result<i64, LinkError>;

    /// Run a debugger command (`G`, `RESET`, ...).
    fn execute(&mut self, command: &str) -> Result<(), LinkError>;

    /// `Debugger.State`: 1 = stopped, 2 = running, 3 = stepping.
    fn debugger_state(&mut self) -> Result<i32, LinkError>;
}

pub struct KeilLink {
    uv: Box<dyn UvEngine>,
}

impl KeilLink {
    pub fn new(uv: Box<dyn UvEngine>) -> Self {
        Self { uv }
    }

    /// Attach to the running uVision automation object.
    #[cfg(windows)]
    pub fn open() -> Result<Self, LinkError> {
        let engine = com::UvCom::connect()?;
        debug!("Attached to the uVision automation object");
        Ok(Self::new(Box::new(engine)))
    }

    #[cfg(not(windows))]
    pub fn open() -> Result<Self, LinkError> {
        debug!("Keil back-end requested off-Windows");
        Err(LinkError::Unsupported(
            "the uVision automation object is only available on Windows",
        ))
    }
}

impl LinkDriver for KeilLink {
    fn read_mem(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, LinkError> {
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let a = addr.wrapping_add(i as u32);
            let v = self.uv.evaluate(&format!("_RBYTE(0x{a:08X})"))?;
            out.push((v & 0xFF) as u8);
        }
        Ok(out)
    }

    fn write_mem(&mut self, addr: u32, data: &[u8]) -> Result<(), LinkError> {
        for (i, b) in data.iter().enumerate() {
            let a = addr.wrapping_add(i as u32);
            self.uv.evaluate(&format!("_WBYTE(0x{a:08X}, 0x{b:02X})"))?;
        }
        Ok(())
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, LinkError> {
        let v = self.uv.evaluate(&format!("_RDWORD(0x{addr:08X})"))?;
        Ok(v as u32)
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), LinkError> {
        self.uv
            .evaluate(&format!("_WDWORD(0x{addr:08X}, 0x{value:08X})"))?;
        Ok(())
    }

    fn read_reg(&mut self, reg: &str) -> Result<u32, LinkError> {
        let v = self
            .uv
            .evaluate(reg)
            .map_err(|_| LinkError::UnsupportedRegister(reg.to_owned()))?;
        Ok(v as u32)
    }

    fn write_reg(&mut self, reg: &str, value: u32) -> Result<(), LinkError> {
        self.uv
            .evaluate(&format!("{reg} = 0x{value:X}"))
            .map_err(|_| LinkError::UnsupportedRegister(reg.to_owned()))?;
        Ok(())
    }

    fn halt(&mut self) -> Result<(), LinkError> {
        self.uv.execute("BS")
    }

    fn go(&mut self) -> Result<(), LinkError> {
        self.uv.execute("G")
    }

    fn step(&mut self) -> Result<(), LinkError> {
        Err(LinkError::Unsupported(
            "single-step is not available over the uVision automation interface",
        ))
    }

    fn reset(&mut self) -> Result<(), LinkError> {
        self.uv.execute("RESET")
    }

    fn halted(&mut self) -> Result<bool, LinkError> {
        Ok(self.uv.debugger_state()? == UV_STATE_STOPPED)
    }
}

#[cfg(windows)]
mod com {
    use super::UvEngine;
    use crate::link::LinkError;
    use windows::core::{Interface, BSTR, GUID, PCWSTR, VARIANT};
    use windows::Win32::System::Com::{
        CLSIDFromProgID, CoCreateInstance, CoInitializeEx, IDispatch, CLSCTX_LOCAL_SERVER,
        COINIT_APARTMENTTHREADED, DISPATCH_METHOD, DISPATCH_PROPERTYGET, DISPPARAMS,
    };
    use windows::Win32::System::Ole::GetActiveObject;

    const PROG_ID: &str = "uVision.Application";
    const LOCALE_USER_DEFAULT: u32 = 0x0400;

    /// Late-bound `IDispatch` wrapper over the uVision application object.
    pub(super) struct UvCom {
        app: IDispatch,
        debugger: IDispatch,
    }

    // The automation object is only touched from the session thread that
    // owns the Link.
    unsafe impl Send for UvCom {}

    fn com_err(context: &str, e: windows::core::Error) -> LinkError {
        LinkError::Transport(format!("uVision automation failure in {context}. {e}"))
    }

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn dispid(obj: &IDispatch, name: &str) -> Result<i32, LinkError> {
        let name_w = wide(name);
        let names = [PCWSTR(name_w.as_ptr())];
        let mut id = 0i32;
        unsafe {
            obj.GetIDsOfNames(
                &GUID::zeroed(),
                names.as_ptr(),
                1,
                LOCALE_USER_DEFAULT,
                &mut id,
            )
        }
        .map_err(|e| com_err(name, e))?;
        Ok(id)
    }

    fn invoke(
        obj: &IDispatch,
        name: &str,
        flags: windows::Win32::System::Com::DISPATCH_FLAGS,
        mut args: Vec<VARIANT>,
    ) -> Result<VARIANT, LinkError> {
        let id = dispid(obj, name)?;
        // Automation argument order is reversed.
        args.reverse();
        let params = DISPPARAMS {
            rgvarg: if args.is_empty() {
                std::ptr::null_mut()
            } else {
                args.as_mut_ptr()
            },
            rgdispidNamedArgs: std::ptr::null_mut(),
            cArgs: args.len() as u32,
            cNamedArgs: 0,
        };
        let mut result = VARIANT::default();
        unsafe {
            obj.Invoke(
                id,
                &GUID::zeroed(),
                LOCALE_USER_DEFAULT,
                flags,
                &params,
                Some(&mut result),
                None,
                None,
            )
        }
        .map_err(|e| com_err(name, e))?;
        Ok(result)
    }

    impl UvCom {
        pub(super) fn connect() -> Result<Self, LinkError> {
            unsafe {
                // S_FALSE (already initialized) is fine.
                let _ = CoInitializeEx(None, COINIT_APARTMENTTHREADED);
            }
            let clsid = unsafe { CLSIDFromProgID(PCWSTR(wide(PROG_ID).as_ptr())) }
                .map_err(|e| com_err("CLSIDFromProgID", e))?;

            let app: IDispatch = unsafe {
                let mut unk = None;
                match GetActiveObject(&clsid, None, &mut unk) {
                    Ok(()) => unk
                        .ok_or_else(|| {
                            LinkError::Transport("uVision returned no active object".to_owned())
                        })?
                        .cast()
                        .map_err(|e| com_err("IDispatch cast", e))?,
                    // Not running: launch a fresh instance.
                    Err(_) => CoCreateInstance(&clsid, None, CLSCTX_LOCAL_SERVER)
                        .map_err(|e| com_err("CoCreateInstance", e))?,
                }
            };

            let debugger = invoke(&app, "Debugger", DISPATCH_PROPERTYGET, Vec::new())?;
            let debugger: IDispatch = IDispatch::try_from(&debugger)
                .map_err(|e| com_err("Debugger property", e))?;

            Ok(Self { app, debugger })
        }
    }

    impl UvEngine for UvCom {
        fn evaluate(&mut self, expr: &str) -> Result<i64, LinkError> {
            let arg = VARIANT::from(BSTR::from(expr));
            let result = invoke(&self.app, "Evaluate", DISPATCH_METHOD, vec![arg])?;
            let text = result.to_string();
            text.parse::<i64>()
                .or_else(|_| text.parse::<f64>().map(|f| f as i64))
                .map_err(|_| {
                    LinkError::Transport(format!(
                        "uVision evaluated '{expr}' to a non-numeric value '{text}'"
                    ))
                })
        }

        fn execute(&mut self, command: &str) -> Result<(), LinkError> {
            let arg = VARIANT::from(BSTR::from(command));
            invoke(&self.app, "Execute", DISPATCH_METHOD, vec![arg])?;
            Ok(())
        }

        fn debugger_state(&mut self) -> Result<i32, LinkError> {
            let state = invoke(&self.debugger, "State", DISPATCH_PROPERTYGET, Vec::new())?;
            state.to_string().parse::<i32>().map_err(|_| {
                LinkError::Transport("uVision reported a non-numeric debugger state".to_owned())
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    /// Records evaluated expressions and serves canned byte values.
    struct MockUv {
        log: Arc<Mutex<Vec<String>>>,
        state: i32,
    }

    impl UvEngine for MockUv {
        fn evaluate(&mut self, expr: &str) -> Result<i64, LinkError> {
            self.log.lock().unwrap().push(expr.to_owned());
            if expr.starts_with("_RBYTE") {
                Ok(0x5A)
            } else if expr.starts_with("_RDWORD") {
                Ok(0x1234_5678)
            } else if expr == "pc" {
                Ok(0x0800_0123)
            } else if expr.starts_with('_') || expr.contains('=') {
                Ok(0)
            } else {
                Err(LinkError::Transport("unknown expression".to_owned()))
            }
        }

        fn execute(&mut self, command: &str) -> Result<(), LinkError> {
            self.log.lock().unwrap().push(format!("exec:{command}"));
            Ok(())
        }

        fn debugger_state(&mut self) -> Result<i32, LinkError> {
            Ok(self.state)
        }
    }

    fn mock_link(state: i32) -> (KeilLink, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let link = KeilLink::new(Box::new(MockUv {
            log: log.clone(),
            state,
        }));
        (link, log)
    }

    #[test]
    fn memory_goes_through_the_expression_evaluator() {
        let (mut link, log) = mock_link(UV_STATE_STOPPED);
        assert_eq!(link.read_mem(0x2000_0000, 2).unwrap(), vec![0x5A, 0x5A]);
        assert_eq!(link.read_u32(0x2000_0010).unwrap(), 0x1234_5678);
        link.write_mem(0x2000_0004, &[0xAB]).unwrap();
        link.write_u32(0x2000_0008, 0xDEAD_BEEF).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "_RBYTE(0x20000000)".to_owned(),
                "_RBYTE(0x20000001)".to_owned(),
                "_RDWORD(0x20000010)".to_owned(),
                "_WBYTE(0x20000004, 0xAB)".to_owned(),
                "_WDWORD(0x20000008, 0xDEADBEEF)".to_owned(),
            ]
        );
    }

    #[test]
    fn run_control_and_registers() {
        let (mut link, log) = mock_link(UV_STATE_STOPPED);
        assert_eq!(link.read_reg("pc").unwrap(), 0x0800_0123);
        assert!(matches!(
            link.read_reg("bogus"),
            Err(LinkError::UnsupportedRegister(_))
        ));
        assert!(matches!(link.step(), Err(LinkError::Unsupported(_))));
        assert!(link.halted().unwrap());
        link.go().unwrap();
        link.reset().unwrap();
        let log = log.lock().unwrap();
        assert!(log.contains(&"exec:G".to_owned()));
        assert!(log.contains(&"exec:RESET".to_owned()));
    }
}
