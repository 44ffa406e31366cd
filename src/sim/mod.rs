//! Backend-independent simulation core
//!
//! A simulation holds two equally sized state images in a [`BufferPair`]. Each
//! frame the update kernel reads the front image and overwrites the back one,
//! then the roles flip so the render kernel and diagnostics see the new state.

use bytemuck::{Pod, Zeroable};

use crate::error::SimError;

pub mod diagnostics;
pub mod driver;
pub mod host;
pub mod kernel;

/// State of a single pixel: position followed by velocity
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PixelState {
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
}

impl PixelState {
    pub const fn new(x: f32, y: f32, vx: f32, vy: f32) -> Self {
        Self { x, y, vx, vy }
    }

    pub const fn splat(v: f32) -> Self {
        Self::new(v, v, v, v)
    }

    /// The state every pixel starts from: its coordinates mapped linearly onto
    /// `[-1, 1] x [-1, 1]`, moving with velocity `(0, 1)`.
    pub fn initial(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self::new(
            (x as f32 / width as f32) * 2.0 - 1.0,
            (y as f32 / height as f32) * 2.0 - 1.0,
            0.0,
            1.0,
        )
    }
}

/// A host-side copy of one state image, stored row-major
#[derive(Clone, Debug, PartialEq)]
pub struct StateFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<PixelState>,
}

impl StateFrame {
    pub fn filled(width: u32, height: u32, value: PixelState) -> StateFrame {
        StateFrame {
            width,
            height,
            pixels: vec![value; width as usize * height as usize],
        }
    }

    /// The deterministic grid written to slot 0 at startup.
    pub fn initial(width: u32, height: u32) -> StateFrame {
        let pixels = (0..height)
            .flat_map(|y| (0..width).map(move |x| PixelState::initial(x, y, width, height)))
            .collect();
        StateFrame {
            width,
            height,
            pixels,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Result<PixelState, SimError> {
        if x >= self.width || y >= self.height {
            return Err(SimError::Index {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        Ok(self.pixels[y as usize * self.width as usize + x as usize])
    }
}

/// One of the two slots of a [`BufferPair`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    First,
    Second,
}

impl Slot {
    pub fn index(self) -> usize {
        match self {
            Slot::First => 0,
            Slot::Second => 1,
        }
    }

    pub fn other(self) -> Slot {
        match self {
            Slot::First => Slot::Second,
            Slot::Second => Slot::First,
        }
    }
}

/// The graphics device a simulation runs on.
///
/// Passed explicitly to every constructor and invocation so the loop never
/// depends on process-wide device or window state.
pub trait GraphicsContext {
    /// A device image holding one full grid of [`PixelState`], usable both as
    /// kernel input and as an offscreen kernel target.
    type Image;
    /// The visible surface for one displayed frame.
    type Surface;

    fn create_state_image(
        &self,
        label: &str,
        width: u32,
        height: u32,
    ) -> Result<Self::Image, SimError>;

    /// Uploads a full grid of pixels, row-major, into `image`.
    fn write_image(&self, image: &mut Self::Image, pixels: &[PixelState])
    -> Result<(), SimError>;

    /// Copies `image` back into host memory, blocking until all prior writes
    /// to it have completed.
    fn read_image(&self, image: &Self::Image) -> Result<StateFrame, SimError>;

    /// Makes the visible surface current for drawing.
    fn acquire_surface(&self) -> Result<Self::Surface, SimError>;

    fn present(&self, surface: Self::Surface);
}

/// Two persistent state images and the front/back roles assigned to them.
///
/// Flipping only relabels the slots; pixel data never moves between them.
pub struct BufferPair<C: GraphicsContext> {
    images: [C::Image; 2],
    front: Slot,
    width: u32,
    height: u32,
}

impl<C: GraphicsContext> BufferPair<C> {
    pub fn create(ctx: &C, width: u32, height: u32) -> Result<Self, SimError> {
        let first = ctx.create_state_image("state image 0", width, height)?;
        let second = ctx.create_state_image("state image 1", width, height)?;
        log::debug!("allocated state images: 2 x {width}x{height}");
        Ok(Self {
            images: [first, second],
            front: Slot::First,
            width,
            height,
        })
    }

    /// Writes the initial grid into slot 0 and makes it the front slot.
    ///
    /// Slot 1 is left untouched; the first update overwrites it before it is
    /// ever read.
    pub fn initialize(&mut self, ctx: &C) -> Result<(), SimError> {
        let initial = StateFrame::initial(self.width, self.height);
        ctx.write_image(&mut self.images[Slot::First.index()], &initial.pixels)?;
        self.front = Slot::First;
        Ok(())
    }

    pub fn front(&self) -> &C::Image {
        &self.images[self.front.index()]
    }

    pub fn back(&self) -> &C::Image {
        &self.images[self.front.other().index()]
    }

    pub fn front_slot(&self) -> Slot {
        self.front
    }

    pub fn back_slot(&self) -> Slot {
        self.front.other()
    }

    pub fn image(&self, slot: Slot) -> &C::Image {
        &self.images[slot.index()]
    }

    pub fn flip(&mut self) {
        self.front = self.front.other();
    }

    /// The update kernel's input (front) and output (back).
    ///
    /// The two references always point at different slots.
    pub fn update_io(&mut self) -> (&C::Image, &mut C::Image) {
        let [first, second] = &mut self.images;
        match self.front {
            Slot::First => (&*first, second),
            Slot::Second => (&*second, first),
        }
    }

    pub fn readback(&self, ctx: &C, slot: Slot) -> Result<StateFrame, SimError> {
        ctx.read_image(self.image(slot))
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::host::HostContext;
    use super::*;

    #[test]
    fn initial_frame_maps_coordinates_row_major() {
        let frame = StateFrame::initial(2, 2);
        assert_eq!(
            frame.pixels,
            vec![
                PixelState::new(-1.0, -1.0, 0.0, 1.0),
                PixelState::new(0.0, -1.0, 0.0, 1.0),
                PixelState::new(-1.0, 0.0, 0.0, 1.0),
                PixelState::new(0.0, 0.0, 0.0, 1.0),
            ]
        );
    }

    #[test]
    fn pixel_lookup_checks_bounds() {
        let frame = StateFrame::initial(4, 4);
        assert_eq!(
            frame.pixel(2, 1).unwrap(),
            PixelState::new(0.0, -0.5, 0.0, 1.0)
        );
        assert!(matches!(
            frame.pixel(4, 0),
            Err(SimError::Index { x: 4, y: 0, .. })
        ));
        assert!(frame.pixel(0, 4).is_err());
    }

    #[test]
    fn flip_is_an_involution() {
        let ctx = HostContext::new(4, 4);
        let mut pair = BufferPair::create(&ctx, 4, 4).unwrap();
        pair.initialize(&ctx).unwrap();
        let front = pair.readback(&ctx, pair.front_slot()).unwrap();

        pair.flip();
        assert_eq!(pair.front_slot(), Slot::Second);
        assert_eq!(pair.readback(&ctx, pair.back_slot()).unwrap(), front);

        pair.flip();
        assert_eq!(pair.front_slot(), Slot::First);
        assert_eq!(pair.readback(&ctx, pair.front_slot()).unwrap(), front);
        let back = ctx.read_image(pair.back()).unwrap();
        assert!(back.pixels.iter().all(|p| p.x.is_nan()));
        assert!(std::ptr::eq(pair.back(), pair.image(Slot::Second)));
        assert!(std::ptr::eq(pair.front(), pair.image(Slot::First)));
    }

    #[test]
    fn update_io_never_aliases() {
        let ctx = HostContext::new(2, 2);
        let mut pair = BufferPair::create(&ctx, 2, 2).unwrap();
        pair.initialize(&ctx).unwrap();
        for _ in 0..3 {
            let (source, target) = pair.update_io();
            assert!(!std::ptr::eq(source, &*target));
            pair.flip();
        }
    }
}
