use std::io;

use arboard::Clipboard;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Length of a generated link credential. WPA passphrases need at least 8.
pub const CREDENTIAL_LEN: usize = 12;

/// Fill `buffer` from `data_source`, stopping early only at end of data.
///
/// Returns the number of bytes placed in `buffer`; anything shorter than
/// `buffer.len()` means the source is exhausted, and `0` means it was
/// already empty.
pub async fn read_chunk<R: AsyncRead + Unpin>(
    data_source: &mut R,
    buffer: &mut [u8],
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = data_source.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Generate a random credential for the link and try to copy it to the
/// clipboard (may fail on headless systems; that is ignored).
pub fn generate_credential() -> String {
    let credential: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(CREDENTIAL_LEN)
        .map(char::from)
        .collect();

    if let Ok(mut clipboard) = Clipboard::new() {
        let _ = clipboard.set_text(credential.clone());
    }

    credential
}
