use crate::display::format_message;
use crate::input::LineInput;
use log::{debug, info, warn};
use shared::{read_packet, write_packet, Metadata, Packet};
use std::error::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A chat session over an established duplex stream
pub struct ChatClient<R, W> {
    reader: R,
    writer: W,
    user: String,
}

impl ChatClient<OwnedReadHalf, OwnedWriteHalf> {
    /// Connects to the server and identifies as `user`
    pub async fn connect(server_addr: &str, user: &str) -> Result<Self, Box<dyn Error>> {
        let stream = TcpStream::connect(server_addr).await?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let client = Self::start(reader, writer, user).await?;

        info!("Connected to {} as {}", server_addr, user);
        Ok(client)
    }
}

impl<R, W> ChatClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Sends the `Hello` frame carrying the user name
    pub async fn start(reader: R, mut writer: W, user: &str) -> std::io::Result<Self> {
        let hello = Packet::Hello {
            metadata: Metadata::with_user(user),
        };
        write_packet(&mut writer, &hello).await?;

        Ok(ChatClient {
            reader,
            writer,
            user: user.to_string(),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Sends every input line and prints every broadcast until either side ends
    ///
    /// End of input closes the sending direction and returns. The server
    /// closing the connection returns as well; a rejection is an error.
    pub async fn run<I, O>(
        self,
        mut input: LineInput<I>,
        mut output: O,
    ) -> Result<(), Box<dyn Error>>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let ChatClient {
            mut reader,
            mut writer,
            user,
        } = self;

        tokio::select! {
            result = send_lines(&mut input, &mut writer) => {
                debug!("Input finished for {}", user);
                result
            }
            result = receive_messages(&mut reader, &mut output) => result,
        }
    }
}

async fn send_lines<I, W>(input: &mut LineInput<I>, writer: &mut W) -> Result<(), Box<dyn Error>>
where
    I: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(text) = input.next_line().await? {
        write_packet(writer, &Packet::Request { text }).await?;
    }

    writer.shutdown().await?;
    Ok(())
}

async fn receive_messages<R, O>(reader: &mut R, output: &mut O) -> Result<(), Box<dyn Error>>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    loop {
        match read_packet(reader).await? {
            Some(Packet::Response { user, text }) => {
                output
                    .write_all(format_message(&user, &text).as_bytes())
                    .await?;
                output.flush().await?;
            }
            Some(Packet::Rejected { reason }) => {
                return Err(format!("server rejected connection: {}", reason).into());
            }
            Some(other) => warn!("Unexpected packet from server: {:?}", other),
            None => {
                info!("Server closed the connection");
                return Ok(());
            }
        }
    }
}
