use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::core::{Chunk, ChunkCoord};
use crate::error::ArchiveError;

const MAGIC_HEADER: &[u8; 4] = b"TWCH";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 4 + 4 + 8;

pub const CHUNK_FILE_EXTENSION: &str = "chunk";

#[derive(Serialize, Deserialize)]
struct ArchivedChunk {
    seed: u64,
    chunk: Chunk,
}

/// One file per chunk under a directory, tagged with the world seed.
pub struct ChunkArchive {
    dir: PathBuf,
    seed: u64,
}

impl ChunkArchive {
    pub fn open<P: AsRef<Path>>(dir: P, seed: u64) -> Result<Self, ArchiveError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, seed })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, coord: ChunkCoord) -> PathBuf {
        self.dir.join(format!(
            "c.{}.{}.{}",
            coord.x, coord.y, CHUNK_FILE_EXTENSION
        ))
    }

    pub fn store(&self, chunk: &Chunk) -> Result<(), ArchiveError> {
        let path = self.path_for(chunk.coord());
        let tmp = path.with_extension("tmp");

        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(MAGIC_HEADER)?;
            writer.write_all(&VERSION.to_le_bytes())?;

            let data = bincode::serialize(&ArchivedChunk {
                seed: self.seed,
                chunk: chunk.clone(),
            })?;
            writer.write_all(&(data.len() as u64).to_le_bytes())?;
            writer.write_all(&data)?;
            writer.flush()?;
        }

        // Readers never observe a half-written file
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// `Ok(None)` when no file exists for the coordinate.
    pub fn load(&self, coord: ChunkCoord) -> Result<Option<Chunk>, ArchiveError> {
        let file = match File::open(self.path_for(coord)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC_HEADER {
            return Err(ArchiveError::BadMagic);
        }

        let mut version_bytes = [0u8; 4];
        reader.read_exact(&mut version_bytes)?;
        let version = u32::from_le_bytes(version_bytes);
        if version != VERSION {
            return Err(ArchiveError::Version(version));
        }

        let mut size_bytes = [0u8; 8];
        reader.read_exact(&mut size_bytes)?;
        let size = u64::from_le_bytes(size_bytes);
        let available = file_len.saturating_sub(HEADER_LEN);
        if size != available {
            return Err(ArchiveError::Corrupt(format!(
                "header declares {size} body bytes, file holds {available}"
            )));
        }

        let mut data = vec![0u8; size as usize];
        reader.read_exact(&mut data)?;

        let archived: ArchivedChunk = bincode::deserialize(&data)?;
        if archived.seed != self.seed {
            return Err(ArchiveError::SeedMismatch {
                expected: self.seed,
                found: archived.seed,
            });
        }
        if archived.chunk.coord() != coord {
            return Err(ArchiveError::Codec(Box::new(bincode::ErrorKind::Custom(
                format!("file for {coord} holds chunk {}", archived.chunk.coord()),
            ))));
        }
        Ok(Some(archived.chunk))
    }
}
