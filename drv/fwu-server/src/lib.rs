// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware update state machine.
//!
//! The server tracks a single update at a time:
//!
//! ```text
//!            write            install             (reboot)
//!  Invalid ---------> Candidate -------> Install ----------> ...
//!     |  ^               |  ^               |
//!     |  |     abort     |  | write         |
//!     |  +---------------+--+---------------+
//!     |                     |
//!     |  accept          Rejected (staging could not be set up)
//!     v
//!  Accepted
//! ```
//!
//! Writing a different image abandons whatever update was in progress.
//! Flash access goes through an [`FwuBootloader`]; the server itself only
//! decides which requests are legal in which state.

#![cfg_attr(not(test), no_std)]

use counters::{count, counters};
use drv_fwu_api::{
    FwuError, ImageId, ImageInfo, ImageSlot, ImageState, InstallOutcome,
    MAX_BLOCK_SIZE,
};
use drv_fwu_bootloader::FwuBootloader;
use ringbuf::{ringbuf, ringbuf_entry};

/// Platform hook for restarting the system.
pub trait SystemReset {
    fn request_reset(&mut self);
}

/// The update in progress, if any.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct UpdateContext {
    pub image: Option<ImageId>,
    pub state: ImageState,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    InitFailed(FwuError),
    Abandoned(ImageId),
    Begin(ImageId),
    Rejected(ImageId, FwuError),
    WriteFailed(FwuError),
    Install(ImageId),
    Outcome(InstallOutcome),
    InstallFailed(FwuError),
    Aborted(ImageId),
    AbortFailed(FwuError),
    Accepted,
    AcceptFailed(FwuError),
    Refused(ImageState),
    Reset,
}

ringbuf!(Trace, 32, Trace::None);
counters!(FwuError);

fn counted<T>(r: Result<T, FwuError>) -> Result<T, FwuError> {
    if let Err(e) = &r {
        count!(*e);
    }
    r
}

pub struct FwuServer<B, R> {
    bootloader: B,
    reset: R,
    ctx: UpdateContext,
}

impl<B: FwuBootloader, R: SystemReset> FwuServer<B, R> {
    pub fn new(bootloader: B, reset: R) -> Self {
        Self {
            bootloader,
            reset,
            ctx: UpdateContext::default(),
        }
    }

    pub fn context(&self) -> &UpdateContext {
        &self.ctx
    }

    pub fn bootloader(&self) -> &B {
        &self.bootloader
    }

    pub fn bootloader_mut(&mut self) -> &mut B {
        &mut self.bootloader
    }

    /// Loads the boot-time image metadata. The server stays usable if this
    /// fails, but queries of running images will fail too.
    pub fn init(&mut self) -> Result<(), FwuError> {
        let r = self.bootloader.initialize();
        if let Err(e) = r {
            ringbuf_entry!(Trace::InitFailed(e));
        }
        counted(r)
    }

    /// Writes one block of a staging image at `offset`.
    pub fn write(
        &mut self,
        id: ImageId,
        offset: u32,
        block: &[u8],
    ) -> Result<(), FwuError> {
        counted(self.write_inner(id, offset, block))
    }

    fn write_inner(
        &mut self,
        id: ImageId,
        offset: u32,
        block: &[u8],
    ) -> Result<(), FwuError> {
        if id.slot() != ImageSlot::Staging {
            return Err(FwuError::NotStagingSlot);
        }
        if block.is_empty() || block.len() > MAX_BLOCK_SIZE {
            return Err(FwuError::BadLength);
        }

        match self.ctx {
            UpdateContext {
                image: Some(cur),
                state,
            } if cur == id => match state {
                ImageState::Candidate => (),
                ImageState::Install | ImageState::Accepted => {
                    ringbuf_entry!(Trace::Refused(state));
                    return Err(FwuError::InvalidState);
                }
                ImageState::Invalid | ImageState::Rejected => {
                    self.begin(id)?
                }
            },
            _ => self.begin(id)?,
        }

        self.bootloader
            .stage_write(id.image_type(), offset, block)
            .map_err(|e| {
                ringbuf_entry!(Trace::WriteFailed(e));
                e
            })
    }

    fn begin(&mut self, id: ImageId) -> Result<(), FwuError> {
        if let Some(old) = self.ctx.image.filter(|&old| old != id) {
            ringbuf_entry!(Trace::Abandoned(old));
        }
        match self.bootloader.stage_begin(id.image_type()) {
            Ok(()) => {
                ringbuf_entry!(Trace::Begin(id));
                self.ctx = UpdateContext {
                    image: Some(id),
                    state: ImageState::Candidate,
                };
                Ok(())
            }
            // Nothing was touched for a type this build cannot stage.
            Err(FwuError::UnsupportedImageType) => {
                Err(FwuError::UnsupportedImageType)
            }
            Err(e) => {
                ringbuf_entry!(Trace::Rejected(id, e));
                self.ctx = UpdateContext {
                    image: Some(id),
                    state: ImageState::Rejected,
                };
                Err(e)
            }
        }
    }

    /// Asks the bootloader to try the staged image on the next boot.
    ///
    /// The update moves to `Install` before the bootloader is asked and stays
    /// there if the bootloader fails; only `abort` gets it out.
    pub fn install(&mut self, id: ImageId) -> Result<InstallOutcome, FwuError> {
        counted(self.install_inner(id))
    }

    fn install_inner(
        &mut self,
        id: ImageId,
    ) -> Result<InstallOutcome, FwuError> {
        match self.ctx {
            UpdateContext {
                image: Some(cur),
                state: ImageState::Candidate,
            } if cur == id => (),
            UpdateContext { state, .. } => {
                ringbuf_entry!(Trace::Refused(state));
                return Err(FwuError::InvalidState);
            }
        }

        ringbuf_entry!(Trace::Install(id));
        self.ctx.state = ImageState::Install;

        match self.bootloader.mark_candidate(id.image_type()) {
            Ok(outcome) => {
                ringbuf_entry!(Trace::Outcome(outcome));
                Ok(outcome)
            }
            Err(e) => {
                ringbuf_entry!(Trace::InstallFailed(e));
                Err(e)
            }
        }
    }

    /// Abandons the update of `id`.
    pub fn abort(&mut self, id: ImageId) -> Result<(), FwuError> {
        counted(self.abort_inner(id))
    }

    fn abort_inner(&mut self, id: ImageId) -> Result<(), FwuError> {
        match self.ctx {
            UpdateContext {
                image: Some(cur),
                state: ImageState::Candidate | ImageState::Install,
            } if cur == id => (),
            UpdateContext { state, .. } => {
                ringbuf_entry!(Trace::Refused(state));
                return Err(FwuError::InvalidState);
            }
        }

        self.ctx = UpdateContext::default();
        ringbuf_entry!(Trace::Aborted(id));

        // The update is gone either way; a stale handle is only worth a note.
        if let Err(e) = self.bootloader.abort(id.image_type()) {
            ringbuf_entry!(Trace::AbortFailed(e));
            count!(e);
        }
        Ok(())
    }

    /// Makes the running image permanent. Only legal with no update in
    /// progress.
    pub fn accept(&mut self) -> Result<(), FwuError> {
        counted(self.accept_inner())
    }

    fn accept_inner(&mut self) -> Result<(), FwuError> {
        if self.ctx.state != ImageState::Invalid {
            ringbuf_entry!(Trace::Refused(self.ctx.state));
            return Err(FwuError::InvalidState);
        }

        self.bootloader.mark_accepted().map_err(|e| {
            ringbuf_entry!(Trace::AcceptFailed(e));
            e
        })?;
        ringbuf_entry!(Trace::Accepted);
        self.ctx.state = ImageState::Accepted;
        Ok(())
    }

    /// Describes the image named by `id`. Never changes the update state.
    pub fn query(&mut self, id: ImageId) -> Result<ImageInfo, FwuError> {
        let active = id.slot() == ImageSlot::Active;
        let mut info =
            counted(self.bootloader.query(id.image_type(), active))?;

        info.id = id;
        info.state = if self.ctx.image == Some(id) {
            self.ctx.state
        } else if active && self.ctx.state == ImageState::Accepted {
            ImageState::Accepted
        } else {
            ImageState::Invalid
        };
        Ok(info)
    }

    pub fn request_reboot(&mut self) {
        ringbuf_entry!(Trace::Reset);
        self.reset.request_reset();
    }
}
