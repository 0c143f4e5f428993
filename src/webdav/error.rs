use err_derive::Error;
use hyper::StatusCode;

use tealfs_util::error::Error as TealError;

#[derive(Debug, Error)]
pub enum Error {
	// Category: internal error
	#[error(display = "Internal error: {}", _0)]
	InternalError(#[error(source)] TealError),

	#[error(display = "Internal error (Hyper error): {}", _0)]
	Hyper(#[error(source)] hyper::Error),

	#[error(display = "Internal error (HTTP error): {}", _0)]
	Http(#[error(source)] http::Error),

	// Category: cannot process
	#[error(display = "Not found")]
	NotFound,

	#[error(display = "Remote node unreachable: {}", _0)]
	NotConnected(String),

	// Category: bad request
	#[error(display = "Bad request: {}", _0)]
	BadRequest(String),
}

impl Error {
	pub fn http_status_code(&self) -> StatusCode {
		match self {
			Error::NotFound => StatusCode::NOT_FOUND,
			Error::NotConnected(_) => StatusCode::SERVICE_UNAVAILABLE,
			Error::InternalError(_) | Error::Hyper(_) | Error::Http(_) => {
				StatusCode::INTERNAL_SERVER_ERROR
			}
			Error::BadRequest(_) => StatusCode::BAD_REQUEST,
		}
	}
}

pub trait OkOrBadRequest {
	type S2;
	fn ok_or_bad_request(self, reason: &'static str) -> Self::S2;
}

impl<T> OkOrBadRequest for Option<T> {
	type S2 = Result<T, Error>;
	fn ok_or_bad_request(self, reason: &'static str) -> Result<T, Error> {
		match self {
			Some(x) => Ok(x),
			None => Err(Error::BadRequest(reason.to_string())),
		}
	}
}
