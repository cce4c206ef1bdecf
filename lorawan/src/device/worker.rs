//! Background execution context owning the MAC layer
//!
//! Radio completion handling and every session mutation happen on one
//! thread. Foreground calls are boxed jobs answered over a rendezvous
//! channel, so at most one join or uplink is ever in flight.

use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use crate::error::Error;
use crate::lorawan::mac::MacLayer;
use crate::lorawan::region::Region;
use crate::radio::traits::Radio;

type Job<R, REG> = Box<dyn FnOnce(&mut MacLayer<R, REG>) + Send>;

enum Request<R: Radio, REG: Region> {
    Run(Job<R, REG>),
    Stop,
}

/// Handle to the running MAC thread
pub struct Worker<R: Radio, REG: Region> {
    requests: Sender<Request<R, REG>>,
    handle: Option<JoinHandle<MacLayer<R, REG>>>,
}

impl<R: Radio, REG: Region> Worker<R, REG> {
    /// Move `mac` onto a new thread
    pub fn spawn(mac: MacLayer<R, REG>) -> Result<Self, Error> {
        let (requests, inbox) = mpsc::channel::<Request<R, REG>>();
        let handle = thread::Builder::new()
            .name("lorawan-mac".into())
            .spawn(move || {
                let mut mac = mac;
                while let Ok(request) = inbox.recv() {
                    match request {
                        Request::Run(job) => job(&mut mac),
                        Request::Stop => break,
                    }
                }
                mac
            })
            .map_err(|error| {
                tracing::warn!(%error, "could not start MAC worker");
                Error::WorkerUnavailable
            })?;

        tracing::debug!("MAC worker started");
        Ok(Self {
            requests,
            handle: Some(handle),
        })
    }

    /// Run `job` on the worker and wait for its result
    pub fn call<T, F>(&self, job: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut MacLayer<R, REG>) -> T + Send + 'static,
    {
        let (reply, result) = mpsc::sync_channel(1);
        let job: Job<R, REG> = Box::new(move |mac| {
            // The caller may have gone away; nothing left to tell it
            let _ = reply.send(job(mac));
        });
        self.requests
            .send(Request::Run(job))
            .map_err(|_| Error::WorkerUnavailable)?;
        result.recv().map_err(|_| Error::WorkerUnavailable)
    }

    /// Stop the thread and take the MAC layer back
    pub fn stop(mut self) -> Result<MacLayer<R, REG>, Error> {
        self.shutdown().ok_or(Error::WorkerUnavailable)
    }

    fn shutdown(&mut self) -> Option<MacLayer<R, REG>> {
        let handle = self.handle.take()?;
        let _ = self.requests.send(Request::Stop);
        match handle.join() {
            Ok(mac) => {
                tracing::debug!("MAC worker stopped");
                Some(mac)
            }
            Err(_) => {
                tracing::warn!("MAC worker panicked");
                None
            }
        }
    }
}

impl<R: Radio, REG: Region> Drop for Worker<R, REG> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
