// Presentation surface - window handles to VkSurfaceKHR
//
// Platform dispatch over raw-window-handle 0.6. Win32, Xlib and Wayland are
// supported; any other handle pair is reported as unsupported.

use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;

use crate::error::{EngineError, Result, VkResultExt};

/// Instance extensions needed to create a surface for `display`.
pub fn required_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => {
            return Err(EngineError::Unsupported(format!("display handle {:?}", other)));
        }
    };
    Ok(vec![khr::Surface::name(), platform])
}

/// Create a surface for a live window.
///
/// # Safety
/// The handles must stay valid until the returned surface is destroyed.
pub unsafe fn create_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    let surface = match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .map_or(std::ptr::null_mut(), |d| d.as_ptr());
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.cast())
                .window(handle.window);
            khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr().cast())
                .surface(handle.surface.as_ptr().cast());
            khr::WaylandSurface::new(entry, instance).create_wayland_surface(&create_info, None)
        }
        (display, window) => {
            return Err(EngineError::Unsupported(format!(
                "window handle {:?} on display {:?}",
                window, display
            )));
        }
    };
    surface.creating("window surface")
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_window_handle::{WaylandDisplayHandle, WindowsDisplayHandle};
    use std::ptr::NonNull;

    #[test]
    fn windows_display_needs_win32_surface() {
        let display = RawDisplayHandle::Windows(WindowsDisplayHandle::new());
        let names = required_extensions(display).unwrap();
        assert_eq!(names, vec![khr::Surface::name(), khr::Win32Surface::name()]);
    }

    #[test]
    fn wayland_display_needs_wayland_surface() {
        let mut dummy = 0u8;
        let ptr = NonNull::from(&mut dummy).cast();
        let display = RawDisplayHandle::Wayland(WaylandDisplayHandle::new(ptr));
        let names = required_extensions(display).unwrap();
        assert!(names.contains(&khr::WaylandSurface::name()));
    }

    #[test]
    fn unknown_platforms_are_unsupported() {
        let display = RawDisplayHandle::Web(raw_window_handle::WebDisplayHandle::new());
        assert!(matches!(required_extensions(display), Err(EngineError::Unsupported(_))));
    }
}
