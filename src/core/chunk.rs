use serde::{Deserialize, Serialize};

/// Index into the tile palette built from the biome table.
pub type TileId = u16;

/// Integer chunk grid coordinates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
}

impl ChunkCoord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chunk containing the world-space tile position.
    pub fn from_world(world_x: f32, world_y: f32, chunk_size: u16) -> Self {
        let size = chunk_size as f32;
        Self {
            x: (world_x / size).floor() as i32,
            y: (world_y / size).floor() as i32,
        }
    }

    /// Like [`ChunkCoord::from_world`], but `None` unless every tile of every
    /// chunk within `radius` of the result is addressable in `i32`.
    pub fn checked_from_world(
        world_x: f32,
        world_y: f32,
        chunk_size: u16,
        radius: u32,
    ) -> Option<Self> {
        if !world_x.is_finite() || !world_y.is_finite() || chunk_size == 0 {
            return None;
        }
        let size = chunk_size as f32;
        let x = (world_x / size).floor() as f64;
        let y = (world_y / size).floor() as f64;
        if x.abs() > i32::MAX as f64 || y.abs() > i32::MAX as f64 {
            return None;
        }
        let center = Self::new(x as i32, y as i32);
        let radius = i32::try_from(radius).ok()?;
        let low = center.checked_offset(-radius, -radius)?;
        let high = center.checked_offset(radius, radius)?;
        low.origin(chunk_size)?;
        high.origin(chunk_size)?;
        Some(center)
    }

    /// World tile coordinates of the chunk's (0, 0) corner. `None` when any
    /// tile of the chunk falls outside `i32`.
    pub fn origin(&self, chunk_size: u16) -> Option<(i32, i32)> {
        let size = chunk_size as i32;
        let span = size.checked_sub(1)?;
        let x = self.x.checked_mul(size)?;
        let y = self.y.checked_mul(size)?;
        x.checked_add(span)?;
        y.checked_add(span)?;
        Some((x, y))
    }

    pub fn checked_offset(&self, dx: i32, dy: i32) -> Option<Self> {
        Some(Self::new(self.x.checked_add(dx)?, self.y.checked_add(dy)?))
    }

    pub fn chebyshev_distance(&self, other: ChunkCoord) -> u32 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }

    /// Square neighborhood of `radius` chunks around `self`, nearest first.
    /// Coordinates past the edge of the `i32` grid are left out.
    pub fn neighborhood(&self, radius: i32) -> Vec<ChunkCoord> {
        let radius = radius.max(0);
        let side = 2 * radius as usize + 1;
        let mut coords = Vec::with_capacity(side * side);
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if let Some(coord) = self.checked_offset(dx, dy) {
                    coords.push(coord);
                }
            }
        }
        coords.sort_by_key(|c| {
            let dx = (c.x - self.x) as i64;
            let dy = (c.y - self.y) as i64;
            (dx * dx + dy * dy, c.y, c.x)
        });
        coords
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A square block of world tiles, stored row-major (`y * size + x`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    coord: ChunkCoord,
    size: u16,
    tiles: Vec<TileId>,
}

impl Chunk {
    pub fn new(coord: ChunkCoord, size: u16) -> Self {
        let len = size as usize * size as usize;
        Chunk {
            coord,
            size,
            tiles: vec![0; len],
        }
    }

    /// Rebuilds a chunk from raw tiles; `None` when the length does not match.
    pub fn from_tiles(coord: ChunkCoord, size: u16, tiles: Vec<TileId>) -> Option<Self> {
        if tiles.len() != size as usize * size as usize {
            return None;
        }
        Some(Chunk { coord, size, tiles })
    }

    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn tiles(&self) -> &[TileId] {
        &self.tiles
    }

    pub fn get_tile(&self, x: u16, y: u16) -> Option<TileId> {
        if x < self.size && y < self.size {
            Some(self.tiles[y as usize * self.size as usize + x as usize])
        } else {
            None
        }
    }

    pub fn set_tile(&mut self, x: u16, y: u16, tile: TileId) {
        if x < self.size && y < self.size {
            self.tiles[y as usize * self.size as usize + x as usize] = tile;
        }
    }
}
