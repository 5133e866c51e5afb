//! Blocking client for a node's client port.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::frame::{recv_record, send_record};
use crate::schema::{
    AcknowledgeMessagesRequest, ClientRequest, ClientResponse, DeliverUndeliveredMessagesRequest,
    DeliverUndeliveredMessagesResponse, ErrorResponse, ListAccountsRequest, ListAccountsResponse,
    Message, SendMessageRequest, UsernameRequest,
};

/// One connection to one node. Requests are answered in order.
pub struct ChatClient {
    stream: TcpStream,
}

impl ChatClient {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).context("failed to connect to chat node")?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Bounds each round trip. `None` waits forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Sends a raw request and waits for its response.
    pub fn request(&mut self, request: &ClientRequest) -> Result<ClientResponse> {
        send_record(&mut self.stream, request).context("failed to send request")?;
        let response: ClientResponse = recv_record(&mut self.stream)
            .context("failed to read response")?
            .ok_or_else(|| anyhow!("node closed the connection"))?;
        if response.opcode() != request.opcode() {
            bail!(
                "node answered {:?} with {:?}",
                request.opcode(),
                response.opcode()
            );
        }
        Ok(response)
    }

    fn expect_error_response(&mut self, request: ClientRequest) -> Result<ErrorResponse> {
        match self.request(&request)? {
            ClientResponse::LogInAccount(r)
            | ClientResponse::CreateAccount(r)
            | ClientResponse::SendMessage(r)
            | ClientResponse::DeleteAccount(r)
            | ClientResponse::LogOutAccount(r)
            | ClientResponse::AcknowledgeMessages(r) => Ok(r),
            other => bail!("unexpected response {:?}", other.opcode()),
        }
    }

    pub fn create_account(&mut self, username: &str) -> Result<ErrorResponse> {
        self.expect_error_response(ClientRequest::CreateAccount(username_request(username)))
    }

    pub fn log_in_account(&mut self, username: &str) -> Result<ErrorResponse> {
        self.expect_error_response(ClientRequest::LogInAccount(username_request(username)))
    }

    pub fn log_out_account(&mut self, username: &str) -> Result<ErrorResponse> {
        self.expect_error_response(ClientRequest::LogOutAccount(username_request(username)))
    }

    pub fn delete_account(&mut self, username: &str) -> Result<ErrorResponse> {
        self.expect_error_response(ClientRequest::DeleteAccount(username_request(username)))
    }

    pub fn list_accounts(&mut self, text_wildcard: &str) -> Result<ListAccountsResponse> {
        let request = ClientRequest::ListAccounts(ListAccountsRequest {
            text_wildcard: text_wildcard.to_string(),
        });
        match self.request(&request)? {
            ClientResponse::ListAccounts(response) => Ok(response),
            other => bail!("unexpected response {:?}", other.opcode()),
        }
    }

    pub fn send_message(&mut self, sender: &str, recipient: &str, body: &str) -> Result<ErrorResponse> {
        self.expect_error_response(ClientRequest::SendMessage(SendMessageRequest {
            message: body.to_string(),
            recipient_username: recipient.to_string(),
            sender_username: sender.to_string(),
        }))
    }

    pub fn deliver_undelivered_messages(
        &mut self,
        username: &str,
        logged_in: bool,
    ) -> Result<DeliverUndeliveredMessagesResponse> {
        let request = ClientRequest::DeliverUndeliveredMessages(DeliverUndeliveredMessagesRequest {
            username: username.to_string(),
            logged_in,
        });
        match self.request(&request)? {
            ClientResponse::DeliverUndeliveredMessages(response) => Ok(response),
            other => bail!("unexpected response {:?}", other.opcode()),
        }
    }

    pub fn acknowledge_messages(&mut self, messages: Vec<Message>) -> Result<ErrorResponse> {
        self.expect_error_response(ClientRequest::AcknowledgeMessages(
            AcknowledgeMessagesRequest { messages },
        ))
    }
}

fn username_request(username: &str) -> UsernameRequest {
    UsernameRequest {
        username: username.to_string(),
    }
}
