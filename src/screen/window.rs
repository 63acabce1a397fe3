//! Win32 window capture.
//!
//! `PrintWindow(PW_RENDERFULLCONTENT)` asks DWM to render the window
//! into our bitmap, so occluded windows still capture correctly. Old
//! GDI-only windows that refuse it get a plain `BitBlt` of their rect.
//!
//! Every DC, bitmap and selection is held by a guard so it is released
//! on every return path.

use std::ffi::c_void;

use windows::Win32::Foundation::{BOOL, HWND, LPARAM, RECT};
use windows::Win32::Graphics::Gdi::{
    BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDIBits,
    GetWindowDC, ReleaseDC, SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS,
    HBITMAP, HDC, HGDIOBJ, SRCCOPY,
};
use windows::Win32::Storage::Xps::{PrintWindow, PRINT_WINDOW_FLAGS};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetWindowRect, GetWindowTextLengthW, GetWindowTextW, IsIconic, IsWindow,
    IsWindowVisible,
};

use super::capture::{SourceInfo, SourceKind};
use super::FrameBuffer;
use crate::error::CaptureError;

const PW_RENDERFULLCONTENT: PRINT_WINDOW_FLAGS = PRINT_WINDOW_FLAGS(2);
const MIN_LISTED_SIZE: i32 = 100;
const EXCLUDED_TITLES: &[&str] = &[
    "Program Manager",
    "Windows Input Experience",
    "MSCTFIME UI",
    "Default IME",
    "Settings",
];

struct WindowDc {
    hwnd: HWND,
    hdc: HDC,
}

impl Drop for WindowDc {
    fn drop(&mut self) {
        unsafe {
            ReleaseDC(self.hwnd, self.hdc);
        }
    }
}

struct MemoryDc(HDC);

impl Drop for MemoryDc {
    fn drop(&mut self) {
        unsafe {
            let _ = DeleteDC(self.0);
        }
    }
}

struct Bitmap(HBITMAP);

impl Drop for Bitmap {
    fn drop(&mut self) {
        unsafe {
            let _ = DeleteObject(HGDIOBJ(self.0 .0));
        }
    }
}

/// Restores the DC's previous object so the bitmap can be deleted.
struct Selection {
    hdc: HDC,
    previous: HGDIOBJ,
}

impl Drop for Selection {
    fn drop(&mut self) {
        unsafe {
            SelectObject(self.hdc, self.previous);
        }
    }
}

fn hwnd(handle: isize) -> HWND {
    HWND(handle as *mut c_void)
}

fn window_rect(window: HWND) -> Option<(i32, i32)> {
    let mut rect = RECT::default();
    unsafe { GetWindowRect(window, &mut rect) }.ok()?;
    Some((rect.right - rect.left, rect.bottom - rect.top))
}

pub fn capture_window(handle: isize) -> Result<FrameBuffer, CaptureError> {
    let window = hwnd(handle);
    unsafe {
        if !IsWindow(window).as_bool() {
            return Err(CaptureError::unavailable("window no longer exists"));
        }
        if IsIconic(window).as_bool() {
            return Err(CaptureError::unavailable("window is minimized"));
        }
    }
    let (w, h) = window_rect(window).ok_or_else(|| CaptureError::unavailable("no window rect"))?;
    if w <= 0 || h <= 0 {
        return Err(CaptureError::unavailable("window has no area"));
    }

    unsafe {
        let hdc = GetWindowDC(window);
        if hdc.is_invalid() {
            return Err(CaptureError::unavailable("GetWindowDC failed"));
        }
        let window_dc = WindowDc { hwnd: window, hdc };

        let mem = CreateCompatibleDC(window_dc.hdc);
        if mem.is_invalid() {
            return Err(CaptureError::unavailable("CreateCompatibleDC failed"));
        }
        let mem_dc = MemoryDc(mem);

        let bmp = CreateCompatibleBitmap(window_dc.hdc, w, h);
        if bmp.is_invalid() {
            return Err(CaptureError::unavailable("CreateCompatibleBitmap failed"));
        }
        let bitmap = Bitmap(bmp);
        let selection = Selection {
            hdc: mem_dc.0,
            previous: SelectObject(mem_dc.0, HGDIOBJ(bitmap.0 .0)),
        };

        if !PrintWindow(window, mem_dc.0, PW_RENDERFULLCONTENT).as_bool() {
            tracing::debug!(hwnd = handle, "PrintWindow refused, falling back to BitBlt");
            BitBlt(mem_dc.0, 0, 0, w, h, window_dc.hdc, 0, 0, SRCCOPY)
                .map_err(|e| CaptureError::unavailable(format!("BitBlt failed: {}", e)))?;
        }

        // Deselect before GetDIBits; the bitmap must not be selected into a DC.
        drop(selection);

        let mut info = BITMAPINFO {
            bmiHeader: BITMAPINFOHEADER {
                biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                biWidth: w,
                biHeight: -h, // top-down rows
                biPlanes: 1,
                biBitCount: 32,
                biCompression: BI_RGB.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut bgra = vec![0u8; w as usize * h as usize * 4];
        let lines = GetDIBits(
            mem_dc.0,
            bitmap.0,
            0,
            h as u32,
            Some(bgra.as_mut_ptr() as *mut c_void),
            &mut info,
            DIB_RGB_COLORS,
        );
        if lines == 0 {
            return Err(CaptureError::unavailable("GetDIBits failed"));
        }

        Ok(FrameBuffer::from_bgra(&bgra, w as usize, h as usize, w as usize * 4))
    }
}

fn window_title(window: HWND) -> Option<String> {
    unsafe {
        let len = GetWindowTextLengthW(window);
        if len <= 0 {
            return None;
        }
        let mut buf = vec![0u16; len as usize + 1];
        let copied = GetWindowTextW(window, &mut buf);
        if copied <= 0 {
            return None;
        }
        Some(String::from_utf16_lossy(&buf[..copied as usize]))
    }
}

unsafe extern "system" fn collect_window(window: HWND, lparam: LPARAM) -> BOOL {
    let out = &mut *(lparam.0 as *mut Vec<SourceInfo>);
    if !IsWindowVisible(window).as_bool() {
        return BOOL(1);
    }
    let Some(title) = window_title(window) else {
        return BOOL(1);
    };
    if EXCLUDED_TITLES.contains(&title.as_str()) {
        return BOOL(1);
    }
    if let Some((w, h)) = window_rect(window) {
        if w > MIN_LISTED_SIZE && h > MIN_LISTED_SIZE {
            out.push(SourceInfo {
                id: window.0 as isize as i64,
                kind: SourceKind::Window,
                name: title.chars().take(60).collect(),
                title,
                width: w as u32,
                height: h as u32,
                thumbnail: None,
            });
        }
    }
    BOOL(1)
}

/// Visible, titled top-level windows, sorted by title.
pub fn list_windows() -> Vec<SourceInfo> {
    let mut windows: Vec<SourceInfo> = Vec::new();
    let ptr = &mut windows as *mut Vec<SourceInfo>;
    if let Err(e) = unsafe { EnumWindows(Some(collect_window), LPARAM(ptr as isize)) } {
        tracing::warn!("window enumeration failed: {}", e);
    }
    windows.sort_by_key(|w| w.title.to_lowercase());
    windows
}
