//! DXGI Desktop Duplication frame source
//!
//! Duplicates one output of one adapter. The duplication API hands out the
//! composed desktop as a GPU texture; regions are copied into CPU-readable
//! staging textures which stay mapped for as long as the
//! [`DxgiStagingSurface`] lives.
//!
//! # Threading
//!
//! The device is created single-threaded. Every D3D call happens on the
//! thread that drives the frame source. The consumer thread only reads the
//! mapped memory of a staging texture, which is plain CPU memory while the
//! mapping is held.

use std::time::Duration;

use tracing::{debug, info};
use windows::{
    Win32::{
        Graphics::{
            Direct3D::{D3D_DRIVER_TYPE_UNKNOWN, D3D_FEATURE_LEVEL_11_0},
            Direct3D11::{
                D3D11_BOX, D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                D3D11_CREATE_DEVICE_SINGLETHREADED, D3D11_MAP_READ, D3D11_MAPPED_SUBRESOURCE,
                D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING, D3D11CreateDevice,
                ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
            },
            Dxgi::{
                Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC},
                CreateDXGIFactory1, DXGI_ERROR_WAIT_TIMEOUT, DXGI_OUTDUPL_FRAME_INFO,
                IDXGIAdapter, IDXGIAdapter1, IDXGIFactory1, IDXGIOutput1, IDXGIOutputDuplication,
                IDXGIResource,
            },
        },
    },
    core::Interface,
};

use super::{FrameAcquisition, FrameSource, PixelLayout, StagingSurface};
use crate::{
    error::{LatencyError, LatencyResult},
    model::{CaptureRegion, DesktopBounds},
};

/// Timeout value meaning "wait forever"
const INFINITE: u32 = u32::MAX;

fn failure(context: &str, error: windows::core::Error) -> LatencyError {
    LatencyError::AcquisitionFailure {
        reason: format!("{context}: {error}"),
    }
}

/// Desktop duplication of a single output
///
/// Fields are declared in reverse acquisition order so they are released
/// frame first, factory last.
pub struct DxgiFrameSource {
    frame:       Option<ID3D11Texture2D>,
    duplication: IDXGIOutputDuplication,
    output:      IDXGIOutput1,
    context:     ID3D11DeviceContext,
    device:      ID3D11Device,
    adapter:     IDXGIAdapter1,
    _factory:    IDXGIFactory1,
    bounds:      DesktopBounds,
}

impl DxgiFrameSource {
    /// Opens duplication of output `output_index` on adapter `adapter_index`
    ///
    /// # Errors
    ///
    /// Returns `AcquisitionFailure` naming the step that failed.
    pub fn open(adapter_index: u32, output_index: u32) -> LatencyResult<Self> {
        let factory: IDXGIFactory1 =
            unsafe { CreateDXGIFactory1() }.map_err(|e| failure("CreateDXGIFactory1", e))?;
        let adapter = unsafe { factory.EnumAdapters1(adapter_index) }
            .map_err(|e| failure("EnumAdapters1", e))?;
        let base_adapter: IDXGIAdapter =
            adapter.cast().map_err(|e| failure("IDXGIAdapter cast", e))?;

        let mut device: Option<ID3D11Device> = None;
        let mut context: Option<ID3D11DeviceContext> = None;
        unsafe {
            D3D11CreateDevice(
                Some(&base_adapter),
                D3D_DRIVER_TYPE_UNKNOWN,
                None,
                D3D11_CREATE_DEVICE_BGRA_SUPPORT | D3D11_CREATE_DEVICE_SINGLETHREADED,
                Some(&[D3D_FEATURE_LEVEL_11_0]),
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
        }
        .map_err(|e| failure("D3D11CreateDevice", e))?;
        let device = device.ok_or_else(|| LatencyError::AcquisitionFailure {
            reason: "D3D11CreateDevice did not return a device".to_string(),
        })?;
        let context = context.ok_or_else(|| LatencyError::AcquisitionFailure {
            reason: "D3D11CreateDevice did not return a device context".to_string(),
        })?;

        let output = unsafe { base_adapter.EnumOutputs(output_index) }
            .map_err(|e| failure("EnumOutputs", e))?;
        let desc = unsafe { output.GetDesc() }.map_err(|e| failure("GetDesc", e))?;
        let rect = desc.DesktopCoordinates;
        let bounds = DesktopBounds {
            left:   rect.left,
            top:    rect.top,
            right:  rect.right,
            bottom: rect.bottom,
        };

        let output: IDXGIOutput1 = output.cast().map_err(|e| failure("IDXGIOutput1 cast", e))?;
        let duplication = unsafe { output.DuplicateOutput(&device) }
            .map_err(|e| failure("DuplicateOutput", e))?;

        info!(
            adapter = adapter_index,
            output = output_index,
            width = bounds.width(),
            height = bounds.height(),
            "Desktop duplication opened"
        );

        Ok(Self {
            frame: None,
            duplication,
            output,
            context,
            device,
            adapter,
            _factory: factory,
            bounds,
        })
    }

    pub fn adapter(&self) -> &IDXGIAdapter1 {
        &self.adapter
    }

    pub fn output(&self) -> &IDXGIOutput1 {
        &self.output
    }

    fn create_staging_texture(&self, width: u32, height: u32) -> LatencyResult<ID3D11Texture2D> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width:          width,
            Height:         height,
            MipLevels:      1,
            ArraySize:      1,
            Format:         DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc:     DXGI_SAMPLE_DESC {
                Count:   1,
                Quality: 0,
            },
            Usage:          D3D11_USAGE_STAGING,
            BindFlags:      Default::default(),
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags:      Default::default(),
        };

        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { self.device.CreateTexture2D(&desc, None, Some(&mut texture)) }
            .map_err(|e| failure("CreateTexture2D", e))?;
        texture.ok_or_else(|| LatencyError::AcquisitionFailure {
            reason: "CreateTexture2D did not return a texture".to_string(),
        })
    }
}

impl FrameSource for DxgiFrameSource {
    type Surface = DxgiStagingSurface;

    fn desktop_bounds(&self) -> LatencyResult<DesktopBounds> {
        Ok(self.bounds)
    }

    fn acquire_next_frame(
        &mut self,
        timeout: Option<Duration>,
    ) -> LatencyResult<FrameAcquisition> {
        let timeout_ms = timeout
            .map(|t| u32::try_from(t.as_millis()).unwrap_or(INFINITE - 1))
            .unwrap_or(INFINITE);

        let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource: Option<IDXGIResource> = None;
        let acquired = unsafe {
            self.duplication
                .AcquireNextFrame(timeout_ms, &mut info, &mut resource)
        };
        if let Err(error) = acquired {
            if error.code() == DXGI_ERROR_WAIT_TIMEOUT {
                return Ok(FrameAcquisition::TimedOut);
            }
            return Err(failure("AcquireNextFrame", error));
        }

        // Only pointer movement or metadata changed.
        if info.AccumulatedFrames == 0 {
            unsafe { self.duplication.ReleaseFrame() }
                .map_err(|e| failure("ReleaseFrame", e))?;
            return Ok(FrameAcquisition::Unchanged);
        }

        let texture = match resource.map(|r| r.cast::<ID3D11Texture2D>()) {
            Some(Ok(texture)) => texture,
            Some(Err(e)) => {
                let _ = unsafe { self.duplication.ReleaseFrame() };
                return Err(failure("ID3D11Texture2D cast", e));
            }
            None => {
                let _ = unsafe { self.duplication.ReleaseFrame() };
                return Err(LatencyError::AcquisitionFailure {
                    reason: "AcquireNextFrame returned no desktop resource".to_string(),
                });
            }
        };

        debug!(accumulated = info.AccumulatedFrames, "Desktop frame acquired");
        self.frame = Some(texture);
        Ok(FrameAcquisition::Updated)
    }

    fn copy_region(&mut self, region: &CaptureRegion) -> LatencyResult<DxgiStagingSurface> {
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| LatencyError::AcquisitionFailure {
                reason: "no desktop frame is held".to_string(),
            })?;

        let (width, height) = (region.width as u32, region.height as u32);
        let staging = self.create_staging_texture(width, height)?;

        let left = (region.x - self.bounds.left) as u32;
        let top = (region.y - self.bounds.top) as u32;
        let source_box = D3D11_BOX {
            left,
            top,
            front: 0,
            right: left + width,
            bottom: top + height,
            back: 1,
        };
        unsafe {
            self.context
                .CopySubresourceRegion(&staging, 0, 0, 0, 0, frame, 0, Some(&source_box));
        }

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            self.context
                .Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
        }
        .map_err(|e| failure("Map", e))?;

        Ok(DxgiStagingSurface {
            texture: staging,
            context: self.context.clone(),
            data: mapped.pData as *const u8,
            row_pitch: mapped.RowPitch as usize,
            width,
            height,
        })
    }

    fn release_frame(&mut self) -> LatencyResult<()> {
        self.frame = None;
        unsafe { self.duplication.ReleaseFrame() }.map_err(|e| failure("ReleaseFrame", e))
    }
}

impl Drop for DxgiFrameSource {
    fn drop(&mut self) {
        if self.frame.take().is_some() {
            let _ = unsafe { self.duplication.ReleaseFrame() };
        }
        info!("Desktop duplication closed");
    }
}

/// Mapped staging texture holding one region of a desktop frame
///
/// The texture is unmapped when the surface is dropped.
pub struct DxgiStagingSurface {
    texture:   ID3D11Texture2D,
    context:   ID3D11DeviceContext,
    data:      *const u8,
    row_pitch: usize,
    width:     u32,
    height:    u32,
}

// SAFETY: the mapped pointer stays valid until `Unmap`, which only runs in
// `Drop`. The consumer thread reads the bytes but never calls into the
// device context; the surface is dropped on the thread that owns the
// context.
unsafe impl Send for DxgiStagingSurface {}

impl StagingSurface for DxgiStagingSurface {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    fn layout(&self) -> PixelLayout {
        PixelLayout::Bgra8
    }

    fn bytes(&self) -> &[u8] {
        if self.height == 0 || self.data.is_null() {
            return &[];
        }
        let len = self.row_pitch * (self.height as usize - 1) + self.width as usize * 4;
        // SAFETY: the mapping covers `row_pitch * height` bytes and stays
        // alive for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.data, len) }
    }
}

impl Drop for DxgiStagingSurface {
    fn drop(&mut self) {
        unsafe { self.context.Unmap(&self.texture, 0) };
    }
}
