use std::time::Instant;

/// The progress of a file download
#[derive(Clone, Debug)]
pub struct FileLoadingProgress {
    /// The time stamp the download started
    pub start_time: Instant,
    /// The size of the part of the file that was already cached before the download started
    pub cached_size: u64,
    /// The size of the file in bytes
    pub size: u64,
    /// The progress of the download in bytes, from 0 to size
    pub progress: u64,
}

/// The progress of getting a checkpoint ready for inference
#[derive(Clone, Debug)]
pub enum ModelLoadingProgress {
    /// A checkpoint file is being fetched
    Downloading {
        /// A description of the file, not a path or URL
        source: String,
        /// How far along the download is
        progress: FileLoadingProgress,
    },
    /// The weights are being read onto the device
    Loading {
        /// The progress of the loading, from 0 to 1
        progress: f32,
    },
}

impl ModelLoadingProgress {
    /// Create a new downloading progress
    pub fn downloading(source: String, progress: FileLoadingProgress) -> Self {
        Self::Downloading { source, progress }
    }

    /// Create a closure that tags download progress with a source description
    pub fn downloading_progress(
        source: String,
    ) -> impl FnMut(FileLoadingProgress) -> Self + Send + Sync {
        move |progress| ModelLoadingProgress::downloading(source.clone(), progress)
    }

    /// Create a new loading progress
    pub fn loading(progress: f32) -> Self {
        Self::Loading { progress }
    }

    /// Return the fraction complete, from 0 to 1
    pub fn progress(&self) -> f32 {
        match self {
            Self::Downloading {
                progress:
                    FileLoadingProgress {
                        progress,
                        size,
                        cached_size,
                        ..
                    },
                ..
            } => {
                let remaining = size.saturating_sub(*cached_size);
                if remaining == 0 {
                    1.
                } else {
                    progress.saturating_sub(*cached_size) as f32 / remaining as f32
                }
            }
            Self::Loading { progress } => *progress,
        }
    }

    /// A terminal progress display with one bar per downloaded file
    pub fn multi_bar_loading_indicator() -> impl FnMut(ModelLoadingProgress) + Send + Sync + 'static
    {
        use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
        use std::collections::HashMap;

        let m = MultiProgress::new();
        let sty = ProgressStyle::with_template(
            "{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] ({decimal_bytes_per_sec}, ETA {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        let mut progress_bars = HashMap::new();

        move |progress| match progress {
            Self::Downloading {
                source,
                progress:
                    FileLoadingProgress {
                        progress,
                        size,
                        cached_size,
                        ..
                    },
            } => {
                let progress_bar = progress_bars.entry(source.clone()).or_insert_with(|| {
                    let pb = m.add(ProgressBar::new(size));
                    pb.set_message(format!("Downloading {source}"));
                    pb.set_style(sty.clone());
                    pb.set_position(cached_size);
                    pb
                });

                progress_bar.set_position(progress);
            }
            loading @ Self::Loading { .. } => {
                for pb in progress_bars.values_mut() {
                    pb.finish();
                }
                let percent = loading.progress() * 100.;
                let _ = m.println(format!("Loading {percent:.2}%"));
            }
        }
    }
}
