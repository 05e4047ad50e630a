// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, TransportError};
use crate::message::Message;

const MAX_BODY_SIZE_BYTES: usize = 1 << 30;

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Header {
    body_size: u64,
}

/// Writes one length-prefixed, bincode-encoded message to `stream`.
pub async fn write_message(stream: &mut TcpStream, msg: &Message) -> Result<()> {
    let bytes = bincode::encode_to_vec(msg, common::bincode_config())
        .map_err(|e| TransportError::Decode(e.to_string()))?;
    let header = Header {
        body_size: bytes.len() as u64,
    };

    stream.write_all(bytemuck::bytes_of(&header)).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed, bincode-encoded message from `stream`.
/// Returns `Err(TransportError::Closed)` if the peer shut the stream down
/// cleanly between messages.
pub async fn read_message(stream: &mut TcpStream) -> Result<Message> {
    let mut header_buf = [0u8; std::mem::size_of::<Header>()];
    match stream.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed)
        }
        Err(e) => return Err(e.into()),
    }
    let header: Header = *bytemuck::from_bytes(&header_buf);

    if header.body_size as usize > MAX_BODY_SIZE_BYTES {
        return Err(TransportError::Decode(format!(
            "body size {} exceeds maximum {}",
            header.body_size, MAX_BODY_SIZE_BYTES
        )));
    }

    let mut buf = vec![0u8; header.body_size as usize];
    stream.read_exact(&mut buf).await?;

    let (msg, _) = bincode::decode_from_slice(&buf, common::bincode_config())
        .map_err(|e| TransportError::Decode(e.to_string()))?;
    Ok(msg)
}
