use std::sync::LazyLock;

use regex::Regex;

// watch, short-link (youtu.be) and embed shapes, anchored at the start only
static YOUTUBE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(
    r"^(https?://)?(www\.)?(youtube|youtu|youtube-nocookie)\.(com|be)/(watch\?v=|embed/|v/|.+\?v=)?([^&=%\?]{11})",
  )
  .expect("hard-coded regex")
});

static SOUNDCLOUD_REGEX: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^(https?://)?(www\.)?soundcloud\.com/[\w\-\.]+")
    .expect("hard-coded regex")
});

/// Whether `url` looks like a YouTube video or a SoundCloud user/track page.
pub fn is_valid_url(url: &str) -> bool {
  YOUTUBE_REGEX.is_match(url) || SOUNDCLOUD_REGEX.is_match(url)
}
