use std::{pin::Pin, sync::Arc, time::SystemTime};

use futures::{Stream, StreamExt};

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("sink error: {0}")]
    Sink(String),
}

pub type EnvelopeStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;

/// What a sink did with its input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkSummary {
    /// Rows persisted (appended or upserted).
    pub written: usize,
    /// Rows dropped as duplicates of rows already stored.
    pub duplicates: usize,
    /// Upstream errors and malformed rows that were logged and skipped.
    pub skipped: usize,
}

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> EnvelopeStream<T>;
}

#[async_trait::async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, input: Envelope<I>) -> Result<Envelope<O>, PipelineError>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<SinkSummary, PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

/// Source adapter running a type-changing transform (e.g. raw record to row)
/// on every item of an inner source.
pub struct Mapped<S, I> {
    pub inner: S,
    pub transform: Arc<dyn Transform<I, crate::Row> + Send + Sync>,
}

#[async_trait::async_trait]
impl<S, I> Source<crate::Row> for Mapped<S, I>
where
    S: Source<I>,
    I: Send + 'static,
{
    async fn stream(&self) -> EnvelopeStream<crate::Row> {
        let t = self.transform.clone();
        let inner = self.inner.stream().await;
        Box::pin(inner.then(move |item| {
            let t = t.clone();
            async move {
                match item {
                    Ok(env) => t.apply(env).await,
                    Err(e) => Err(e),
                }
            }
        }))
    }
}

pub struct Pipeline<S, T, K> {
    pub source: S,
    pub transforms: Vec<Arc<dyn Transform<T, T> + Send + Sync>>, // same-type transforms chain
    pub sink: K,
}

impl<T, S, K> Pipeline<S, T, K>
where
    T: Send + 'static,
    S: Source<T> + Send + Sync + 'static,
    K: Sink<T> + Send + Sync + 'static,
{
    /// Drive the source through the transforms into the sink, one item at a
    /// time. Errors of single items travel down to the sink, which decides
    /// whether they are fatal.
    pub async fn run(self) -> Result<SinkSummary, PipelineError> {
        let mut stream = self.source.stream().await;

        for t in self.transforms {
            let t_arc = t.clone();
            stream = Box::pin(stream.then(move |item| {
                let t_inner = t_arc.clone();
                async move {
                    match item {
                        Ok(env) => t_inner.apply(env).await,
                        Err(e) => Err(e),
                    }
                }
            }));
        }

        self.sink.run(stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct VecSource(Vec<Result<u32, &'static str>>);

    #[async_trait::async_trait]
    impl Source<u32> for VecSource {
        async fn stream(&self) -> EnvelopeStream<u32> {
            let items: Vec<_> = self
                .0
                .iter()
                .map(|r| match r {
                    Ok(v) => Ok(Envelope::new(*v)),
                    Err(e) => Err(PipelineError::Source(e.to_string())),
                })
                .collect();
            Box::pin(futures::stream::iter(items))
        }
    }

    struct RejectOdd;

    #[async_trait::async_trait]
    impl Transform<u32, u32> for RejectOdd {
        async fn apply(&self, input: Envelope<u32>) -> Result<Envelope<u32>, PipelineError> {
            if input.payload % 2 == 1 {
                Err(PipelineError::Transform("odd".to_string()))
            } else {
                Ok(input)
            }
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<u32>>);

    #[async_trait::async_trait]
    impl Sink<u32> for Collect {
        async fn run<S>(&self, mut input: S) -> Result<SinkSummary, PipelineError>
        where
            S: Stream<Item = Result<Envelope<u32>, PipelineError>> + Send + Unpin + 'static,
        {
            let mut summary = SinkSummary::default();
            while let Some(item) = input.next().await {
                match item {
                    Ok(env) => {
                        self.0.lock().expect("lock").push(env.payload);
                        summary.written += 1;
                    }
                    Err(_) => summary.skipped += 1,
                }
            }
            Ok(summary)
        }
    }

    #[tokio::test]
    async fn errors_flow_to_sink_without_stopping_the_stream() {
        let sink = Arc::new(Collect::default());
        let pipeline = Pipeline {
            source: VecSource(vec![Ok(2), Ok(3), Err("page skipped"), Ok(4)]),
            transforms: vec![Arc::new(RejectOdd)],
            sink: SharedSink(sink.clone()),
        };

        let summary = pipeline.run().await.expect("pipeline");
        assert_eq!(summary.written, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(*sink.0.lock().expect("lock"), vec![2, 4]);
    }

    struct SharedSink(Arc<Collect>);

    #[async_trait::async_trait]
    impl Sink<u32> for SharedSink {
        async fn run<S>(&self, input: S) -> Result<SinkSummary, PipelineError>
        where
            S: Stream<Item = Result<Envelope<u32>, PipelineError>> + Send + Unpin + 'static,
        {
            self.0.run(input).await
        }
    }
}
