//! Directory-backed storage: the files directly under one root directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fxfer_core::{integrity, Storage};

pub struct DirStorage {
    root: PathBuf,
    /// File open for chunked reads while a send is in progress.
    reading: Option<(String, File)>,
    /// File being received.
    writing: Option<(String, File)>,
}

impl DirStorage {
    /// Storage over `root`, created if missing.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            reading: None,
            writing: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names are plain file names; anything that could leave the root is refused.
    fn path(&self, name: &str) -> io::Result<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid file name {:?}", name),
            ));
        }
        Ok(self.root.join(name))
    }

    fn reader(&mut self, name: &str) -> io::Result<&mut File> {
        let cached = matches!(&self.reading, Some((open, _)) if open == name);
        if !cached {
            let file = File::open(self.path(name)?)?;
            self.reading = Some((name.to_owned(), file));
        }
        match &mut self.reading {
            Some((_, file)) => Ok(file),
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }
}

impl Storage for DirStorage {
    fn list_files(&mut self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            // Names that are not UTF-8 cannot go on the wire.
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn file_hash(&mut self, name: &str) -> io::Result<u32> {
        let file = File::open(self.path(name)?)?;
        integrity::checksum_reader(io::BufReader::new(file))
    }

    fn file_size(&mut self, name: &str) -> io::Result<u64> {
        let meta = fs::metadata(self.path(name)?)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", name),
            ));
        }
        Ok(meta.len())
    }

    fn read_chunk(&mut self, name: &str, offset: u64, out: &mut [u8]) -> io::Result<()> {
        let file = self.reader(name)?;
        file.seek(SeekFrom::Start(offset))?;
        let read = file.read_exact(out);
        let at_end = match file.metadata() {
            Ok(meta) => offset + out.len() as u64 >= meta.len(),
            Err(_) => true,
        };
        // Segment 0 is the tail of the file; a finished or failed send must not pin it open.
        if read.is_err() || at_end {
            self.reading = None;
        }
        read
    }

    fn begin_receive(&mut self, name: &str) -> io::Result<()> {
        let file = File::create(self.path(name)?)?;
        if matches!(&self.reading, Some((open, _)) if open == name) {
            self.reading = None;
        }
        self.writing = Some((name.to_owned(), file));
        Ok(())
    }

    fn append(&mut self, name: &str, data: &[u8], last: bool) -> io::Result<bool> {
        let receiving = matches!(&self.writing, Some((open, _)) if open == name);
        if !receiving {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(self.path(name)?)?;
            self.writing = Some((name.to_owned(), file));
        }
        let Some((_, file)) = self.writing.as_mut() else {
            return Err(io::ErrorKind::NotFound.into());
        };
        file.write_all(data)?;
        if last {
            file.sync_all()?;
            self.writing = None;
        }
        Ok(last)
    }
}
