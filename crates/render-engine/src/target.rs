//! Off-screen render targets and their host-side readback buffers.

use castcap_common::error::{CastcapError, CastcapResult};
use castcap_platform_core::Dimensions;

use crate::gles::{FramebufferId, GlesApi, TextureId, GL_FRAMEBUFFER_COMPLETE};

/// Host buffers for the three planes, carried across sessions so that a
/// resize does not reallocate them. Capacity only ever grows.
#[derive(Debug, Default)]
pub struct PlaneBuffers {
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

impl PlaneBuffers {
    /// Total bytes currently reserved.
    pub fn capacity(&self) -> usize {
        self.y.capacity() + self.u.capacity() + self.v.capacity()
    }
}

/// An R8 texture, the framebuffer rendering into it, and the host buffer
/// it is read back into.
#[derive(Debug)]
pub struct RenderTarget {
    size: Dimensions,
    texture: TextureId,
    framebuffer: FramebufferId,
    host: Vec<u8>,
}

impl RenderTarget {
    /// Create a target of `size`, adopting `host` as its readback buffer.
    ///
    /// An incomplete framebuffer is deleted along with its texture before
    /// the error is returned.
    pub fn new(gl: &mut dyn GlesApi, size: Dimensions, host: Vec<u8>) -> CastcapResult<Self> {
        let texture = gl.create_plane_texture(size);
        let framebuffer = gl.create_framebuffer(texture);

        let status = gl.framebuffer_status(framebuffer);
        if status != GL_FRAMEBUFFER_COMPLETE {
            gl.delete_framebuffer(framebuffer);
            gl.delete_texture(texture);
            return Err(CastcapError::FramebufferIncomplete { status });
        }

        Ok(Self {
            size,
            texture,
            framebuffer,
            host,
        })
    }

    pub fn size(&self) -> Dimensions {
        self.size
    }

    /// Bind the framebuffer and set the viewport to cover it.
    pub fn bind(&self, gl: &mut dyn GlesApi) {
        gl.bind_framebuffer(self.framebuffer);
        gl.viewport(self.size);
    }

    /// Read the framebuffer into the host buffer, growing it first if the
    /// target holds more pixels than it has room for.
    pub fn read_back(&mut self, gl: &mut dyn GlesApi) {
        let needed = self.size.pixel_count();
        if self.host.len() < needed {
            self.host.resize(needed, 0);
        }
        gl.read_pixels(self.size, &mut self.host[..needed]);
    }

    /// Pixels from the last readback, tightly packed.
    pub fn pixels(&self) -> &[u8] {
        let needed = self.size.pixel_count().min(self.host.len());
        &self.host[..needed]
    }

    /// Delete the GPU objects and hand back the host buffer.
    pub fn delete(self, gl: &mut dyn GlesApi) -> Vec<u8> {
        gl.delete_framebuffer(self.framebuffer);
        gl.delete_texture(self.texture);
        self.host
    }

    /// Give up the host buffer without GPU calls, for a context that is
    /// already gone.
    pub fn abandon(self) -> Vec<u8> {
        self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::{FailurePoint, SoftwareGles};

    #[test]
    fn buffer_grows_on_first_readback_only() {
        let gl = SoftwareGles::new();
        let mut api = gl.clone();
        let mut target = RenderTarget::new(&mut api, Dimensions::new(16, 8), Vec::new()).unwrap();
        assert!(target.pixels().is_empty());

        target.read_back(&mut api);
        assert_eq!(target.pixels().len(), 128);
        let ptr = target.pixels().as_ptr();

        target.read_back(&mut api);
        assert_eq!(target.pixels().as_ptr(), ptr);

        let host = target.delete(&mut api);
        assert!(host.capacity() >= 128);
        assert!(gl.live_objects().is_empty());
    }

    #[test]
    fn larger_buffer_is_not_shrunk() {
        let gl = SoftwareGles::new();
        let mut api = gl.clone();
        let mut target =
            RenderTarget::new(&mut api, Dimensions::new(8, 8), vec![0u8; 4096]).unwrap();
        target.read_back(&mut api);
        assert_eq!(target.pixels().len(), 64);
        let host = target.delete(&mut api);
        assert_eq!(host.len(), 4096);
    }

    #[test]
    fn incomplete_framebuffer_is_reported_and_cleaned_up() {
        let gl = SoftwareGles::new();
        gl.fail_next(FailurePoint::FramebufferIncomplete);
        let mut api = gl.clone();
        let err = RenderTarget::new(&mut api, Dimensions::new(8, 8), Vec::new()).unwrap_err();
        assert!(matches!(err, CastcapError::FramebufferIncomplete { .. }));
        assert!(gl.live_objects().is_empty());
    }
}
