use std::borrow::Cow;

use merchfeed_db::models::{ParsingResult, Product, Shipping};
use miette::Diagnostic;
use quick_xml::Reader;
use quick_xml::escape::{resolve_html5_entity, unescape_with};
use quick_xml::events::Event;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;

#[derive(Debug, Error, Diagnostic)]
pub enum DecodeError {
    #[error("can't read xml token")]
    Xml(#[source] quick_xml::Error),

    #[error("feed file ended in the middle of an item")]
    UnexpectedEof,

    #[error("parsing result receiver dropped")]
    Cancelled,
}

/// Error decoding a single item. These do not stop the feed; the item is
/// reported as failed and decoding continues with the next one.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("can't decode item text")]
    Text(#[source] quick_xml::Error),

    #[error("item text is not valid utf-8")]
    Utf8(#[source] std::str::Utf8Error),
}

/// Streaming decoder for Google Merchant xml feeds.
pub struct Decoder;

impl Decoder {
    /// Reads `<item>` elements from `reader` and pushes one [`ParsingResult`]
    /// per item into `output`, in document order. Elements outside `item`
    /// are skipped, which permits arbitrary wrapper elements, and element
    /// names are matched on their local part so `g:id` and `id` are the
    /// same field.
    ///
    /// Returns cleanly at end of input. Ill-formed xml terminates the
    /// stream after reporting the offending item; anything already emitted
    /// stands.
    pub async fn decode<R>(
        &self,
        reader: R,
        output: &mpsc::Sender<ParsingResult>,
    ) -> Result<(), DecodeError>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut xml = Reader::from_reader(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match xml
                .read_event_into_async(&mut buf)
                .await
                .map_err(DecodeError::Xml)?
            {
                Event::Eof => return Ok(()),
                Event::Empty(empty) if empty.local_name().as_ref() == b"item" => {
                    send(output, ParsingResult::product(Product::default())).await?;
                }
                Event::Start(start) if start.local_name().as_ref() == b"item" => {
                    match decode_item(&mut xml).await {
                        Ok((product, None)) => {
                            send(output, ParsingResult::product(product)).await?;
                        }
                        Ok((_, Some(item_error))) => {
                            send(output, ParsingResult::error(item_error)).await?;
                        }
                        Err(err) => {
                            // Mirror the item-level failure to the consumer
                            // before terminating the stream.
                            let _ = output.send(ParsingResult::error(err.to_string())).await;
                            return Err(err);
                        }
                    }
                }
                _ => continue,
            }
        }
    }
}

/// Decodes one `<item>` subtree. The start tag has already been consumed.
///
/// Returns the product, or the per-item error if some of its text could not
/// be decoded; either way the whole subtree is consumed. Ill-formed xml is
/// fatal and returned as `Err`.
async fn decode_item<R>(xml: &mut Reader<R>) -> Result<(Product, Option<ItemError>), DecodeError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut product = Product::default();
    let mut item_error: Option<ItemError> = None;

    // Nesting depth inside the item; 0 means item level.
    let mut depth = 0usize;
    let mut field: Option<Vec<u8>> = None;
    let mut text = String::new();
    let mut shipping: Option<Shipping> = None;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match xml
            .read_event_into_async(&mut buf)
            .await
            .map_err(DecodeError::Xml)?
        {
            Event::Eof => return Err(DecodeError::UnexpectedEof),
            Event::Start(start) => {
                depth += 1;
                if depth == 1 && start.local_name().as_ref() == b"shipping" {
                    shipping = Some(Shipping::default());
                    field = None;
                } else {
                    field = Some(start.local_name().as_ref().to_vec());
                    text.clear();
                }
            }
            Event::Empty(empty) => {
                let name = empty.local_name().as_ref().to_vec();
                match shipping.as_mut() {
                    Some(active) => assign_shipping_field(active, &name, String::new()),
                    None if depth == 0 => assign_product_field(&mut product, &name, String::new()),
                    None => {}
                }
            }
            Event::Text(value) => {
                if field.is_some() {
                    match value.unescape() {
                        Ok(unescaped) => text.push_str(&unescaped),
                        Err(err) => {
                            item_error.get_or_insert(ItemError::Text(err.into()));
                        }
                    }
                }
            }
            Event::CData(value) => {
                if field.is_some() {
                    match std::str::from_utf8(&value) {
                        Ok(decoded) => text.push_str(decoded),
                        Err(err) => {
                            item_error.get_or_insert(ItemError::Utf8(err));
                        }
                    }
                }
            }
            Event::End(end) => {
                if depth == 0 {
                    // </item>
                    break;
                }
                depth -= 1;

                let name = end.local_name().as_ref().to_vec();
                if shipping.is_some() {
                    if depth == 1 {
                        if let Some(active) = shipping.as_mut() {
                            assign_shipping_field(active, &name, std::mem::take(&mut text));
                        }
                        field = None;
                    } else if depth == 0
                        && let Some(finished) = shipping.take()
                    {
                        product.shippings.push(finished);
                    }
                } else if depth == 0 && field.take().is_some() {
                    assign_product_field(&mut product, &name, std::mem::take(&mut text));
                }
            }
            _ => continue,
        }
    }

    if let Some(item_error) = item_error {
        return Ok((Product::default(), Some(item_error)));
    }

    unescape_product_fields(&mut product);
    Ok((product, None))
}

fn assign_product_field(product: &mut Product, name: &[u8], value: String) {
    match name {
        b"id" => product.product_id = value,
        b"title" => product.title = value,
        b"description" => product.description = value,
        b"link" => product.url = value,
        b"image_link" => product.image_url = value,
        b"additional_image_link" => product.additional_image_urls.push(value),
        b"condition" => product.condition = value,
        b"availability" => product.availability = value,
        b"price" => product.price = value,
        b"brand" => product.brand = Some(value),
        b"gtin" => product.gtin = Some(value),
        b"mpn" => product.mpn = Some(value),
        b"google_product_category" => product.product_category = Some(value),
        b"product_type" => product.product_type = Some(value),
        b"color" => product.color = Some(value),
        b"size" => product.size = Some(value),
        b"item_group_id" => product.item_group_id = Some(value),
        b"gender" => product.gender = Some(value),
        b"age_group" => product.age_group = Some(value),
        _ => {}
    }
}

fn assign_shipping_field(shipping: &mut Shipping, name: &[u8], value: String) {
    match name {
        b"country" => shipping.country = value,
        b"service" => shipping.service = value,
        b"price" => shipping.price = value,
        _ => {}
    }
}

/// Feed files html-escape their free-text fields; resolve what the xml
/// unescaping left behind.
fn unescape_product_fields(product: &mut Product) {
    unescape_html(&mut product.title);
    unescape_html(&mut product.description);
    if let Some(category) = product.product_category.as_mut() {
        unescape_html(category);
    }
    if let Some(product_type) = product.product_type.as_mut() {
        unescape_html(product_type);
    }
}

/// Resolves html entities in place. Text that fails to unescape (a stray
/// `&`, an unknown entity) is kept as-is.
fn unescape_html(value: &mut String) {
    if !value.contains('&') {
        return;
    }
    if let Ok(Cow::Owned(unescaped)) = unescape_with(value.as_str(), resolve_html5_entity) {
        *value = unescaped;
    }
}

async fn send(
    output: &mpsc::Sender<ParsingResult>,
    result: ParsingResult,
) -> Result<(), DecodeError> {
    output.send(result).await.map_err(|_| DecodeError::Cancelled)
}
