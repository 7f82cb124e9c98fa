/// Launch-on-login registration via `HKCU\Software\Microsoft\Windows\CurrentVersion\Run`.
///
/// Toggled with the `--register-startup` / `--unregister-startup` flags.
/// On non-Windows platforms both operations succeed as no-ops.
use anyhow::Result;
use tracing::info;

pub const APP_NAME: &str = "AudioPin";

#[cfg(windows)]
mod imp {
    use anyhow::{bail, Result};
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_SUCCESS};
    use windows::Win32::System::Registry::{
        RegCloseKey, RegCreateKeyExW, RegDeleteValueW, RegOpenKeyExW, RegSetValueExW, HKEY,
        HKEY_CURRENT_USER, KEY_SET_VALUE, REG_OPTION_NON_VOLATILE, REG_SZ,
    };

    const RUN_KEY: &str = r"Software\Microsoft\Windows\CurrentVersion\Run";

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    /// Closes the wrapped key on drop.
    struct Key(HKEY);

    impl Drop for Key {
        fn drop(&mut self) {
            unsafe {
                let _ = RegCloseKey(self.0);
            }
        }
    }

    /// Writes `value_name = exe_path` under the Run key.  Idempotent.
    pub fn set(value_name: &str, exe_path: &str) -> Result<()> {
        let key_w = to_wide(RUN_KEY);
        let val_w = to_wide(value_name);
        let data_w = to_wide(exe_path);
        let data_bytes: &[u8] = unsafe {
            std::slice::from_raw_parts(data_w.as_ptr() as *const u8, data_w.len() * 2)
        };

        let mut hkey = HKEY::default();
        let err = unsafe {
            RegCreateKeyExW(
                HKEY_CURRENT_USER,
                PCWSTR::from_raw(key_w.as_ptr()),
                0,
                PCWSTR::null(),
                REG_OPTION_NON_VOLATILE,
                KEY_SET_VALUE,
                None,
                &mut hkey,
                None,
            )
        };
        if err != ERROR_SUCCESS {
            bail!("RegCreateKeyExW failed: {:?}", err);
        }
        let key = Key(hkey);

        let err = unsafe {
            RegSetValueExW(key.0, PCWSTR::from_raw(val_w.as_ptr()), 0, REG_SZ, Some(data_bytes))
        };
        if err != ERROR_SUCCESS {
            bail!("RegSetValueExW failed: {:?}", err);
        }
        Ok(())
    }

    /// Deletes `value_name` from the Run key.  Absent key or value is not an error.
    pub fn remove(value_name: &str) -> Result<()> {
        let key_w = to_wide(RUN_KEY);
        let val_w = to_wide(value_name);

        let mut hkey = HKEY::default();
        let err = unsafe {
            RegOpenKeyExW(
                HKEY_CURRENT_USER,
                PCWSTR::from_raw(key_w.as_ptr()),
                0,
                KEY_SET_VALUE,
                &mut hkey,
            )
        };
        if err != ERROR_SUCCESS {
            return Ok(());
        }
        let key = Key(hkey);

        let err = unsafe { RegDeleteValueW(key.0, PCWSTR::from_raw(val_w.as_ptr())) };
        if err != ERROR_SUCCESS && err != ERROR_FILE_NOT_FOUND {
            bail!("RegDeleteValueW failed: {:?}", err);
        }
        Ok(())
    }
}

/// Adds or removes the running binary from the login autostart list.
pub fn set_autostart(enabled: bool) -> Result<()> {
    #[cfg(windows)]
    {
        if enabled {
            let exe = std::env::current_exe()
                .map_err(|e| anyhow::anyhow!("Failed to locate daemon executable: {e}"))?;
            imp::set(APP_NAME, &exe.to_string_lossy())?;
        } else {
            imp::remove(APP_NAME)?;
        }
    }

    if enabled {
        info!("Added {APP_NAME} to autostart");
    } else {
        info!("Removed {APP_NAME} from autostart");
    }
    Ok(())
}
